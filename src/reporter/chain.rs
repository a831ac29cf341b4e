//! Chain access seam.
//!
//! The reporter talks to the L1 node and the oracle contract through two
//! narrow traits so the round state machine can be exercised against mocks.
//! The production implementations wrap an ethers websocket provider with a
//! keystore-backed signer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::contract::{abigen, ContractError, Event, EthEvent};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockId, BlockNumber, SyncingStatus, H256, U256};
use ethers::utils::get_contract_address;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

abigen!(
    OracleContractBinding,
    r#"[
        function getRound() external view returns (uint256)
        function getSymbols() external view returns (string[])
        function getCommittee() external view returns (address[])
        function vote(uint256 commit, uint256[] reports, uint256 salt) external
        event UpdatedRound(uint256 round)
        event UpdatedSymbols(string[] symbols)
    ]"#
);

/// The oracle contract lives at the address the zero account creates at
/// nonce 1, so it can be derived instead of configured.
pub fn oracle_contract_address() -> Address {
    get_contract_address(Address::zero(), U256::one())
}

/// Operations the reporter needs from the L1 rpc client.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    /// `true` while the node is still catching up with its peers.
    async fn syncing(&self) -> Result<bool>;
    async fn pending_nonce(&self, account: Address) -> Result<U256>;
    async fn suggest_gas_price(&self) -> Result<U256>;
    async fn chain_id(&self) -> Result<U256>;
}

/// Fully resolved parameters of one vote transaction.
#[derive(Debug, Clone)]
pub struct VoteTx {
    pub commitment: U256,
    /// Previous round's symbol-ordered price list; `None` on commit-only.
    pub votes: Option<Vec<U256>>,
    /// Previous round's salt; `None` on commit-only.
    pub salt: Option<U256>,
    pub nonce: U256,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub chain_id: U256,
}

/// Operations the reporter needs from the on-chain oracle contract.
#[async_trait]
pub trait OracleContract: Send + Sync {
    async fn get_round(&self) -> Result<u64>;
    async fn get_symbols(&self) -> Result<Vec<String>>;
    async fn get_committee(&self) -> Result<Vec<Address>>;
    async fn vote(&self, tx: VoteTx) -> Result<H256>;
}

/// A live chain connection: client, bound contract, and the event plus
/// subscription-error channels. Dropping it closes the websocket transport
/// and ends both subscription pump tasks.
pub struct Connection {
    pub rpc: Arc<dyn ChainRpc>,
    pub contract: Arc<dyn OracleContract>,
    pub round_events: mpsc::Receiver<u64>,
    pub symbols_events: mpsc::Receiver<Vec<String>>,
    pub round_sub_err: mpsc::Receiver<String>,
    pub symbols_sub_err: mpsc::Receiver<String>,
}

/// Builds fresh connections, both at startup and after a health-check
/// failure.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self) -> Result<Connection>;
}

type WsClient = SignerMiddleware<Provider<Ws>, LocalWallet>;

/// Production connector: websocket provider, keystore wallet, oracle
/// contract binding at the deterministic address.
pub struct WsConnector {
    pub ws_url: String,
    pub wallet: LocalWallet,
    pub contract_address: Address,
}

#[async_trait]
impl ChainConnector for WsConnector {
    async fn connect(&self) -> Result<Connection> {
        let provider = Provider::<Ws>::connect(&self.ws_url)
            .await
            .with_context(|| format!("dialing l1 websocket endpoint {} failed", self.ws_url))?;
        let chain_id = provider
            .get_chainid()
            .await
            .context("querying chain id failed")?;
        let wallet = self.wallet.clone().with_chain_id(chain_id.as_u64());
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = OracleContractBinding::new(self.contract_address, client.clone());

        let (round_tx, round_events) = mpsc::channel(64);
        let (round_err_tx, round_sub_err) = mpsc::channel(1);
        let round_ready = spawn_event_pump(
            contract.updated_round_filter(),
            |ev: UpdatedRoundFilter| ev.round.as_u64(),
            round_tx,
            round_err_tx,
        );

        let (symbols_tx, symbols_events) = mpsc::channel(64);
        let (symbols_err_tx, symbols_sub_err) = mpsc::channel(1);
        let symbols_ready = spawn_event_pump(
            contract.updated_symbols_filter(),
            |ev: UpdatedSymbolsFilter| ev.symbols,
            symbols_tx,
            symbols_err_tx,
        );

        round_ready
            .await
            .context("round subscription task died")?
            .context("subscribing to round events failed")?;
        symbols_ready
            .await
            .context("symbols subscription task died")?
            .context("subscribing to symbols events failed")?;

        Ok(Connection {
            rpc: Arc::new(EthersRpc {
                inner: client.clone(),
            }),
            contract: Arc::new(EthersOracleContract { inner: contract }),
            round_events,
            symbols_events,
            round_sub_err,
            symbols_sub_err,
        })
    }
}

/// Forwards a contract event stream into an mpsc channel. Subscription
/// success is reported through the returned oneshot; a stream error or end
/// goes to `err_tx` and terminates the task.
fn spawn_event_pump<D, T, F>(
    event: Event<Arc<WsClient>, WsClient, D>,
    map: F,
    tx: mpsc::Sender<T>,
    err_tx: mpsc::Sender<String>,
) -> oneshot::Receiver<Result<()>>
where
    D: EthEvent + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(D) -> T + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(async move {
        let stream = match event.stream().await {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready_tx.send(Err(anyhow::Error::new(e)));
                return;
            }
        };
        futures_util::pin_mut!(stream);

        while let Some(item) = stream.next().await {
            match item {
                Ok(ev) => {
                    if tx.send(map(ev)).await.is_err() {
                        // connection dropped, unsubscribe by exiting
                        return;
                    }
                }
                Err(e) => {
                    let _ = err_tx.send(e.to_string()).await;
                    return;
                }
            }
        }
        let _ = err_tx.send("event stream ended".to_string()).await;
    });
    ready_rx
}

struct EthersRpc {
    inner: Arc<WsClient>,
}

#[async_trait]
impl ChainRpc for EthersRpc {
    async fn block_number(&self) -> Result<u64> {
        let height = self
            .inner
            .get_block_number()
            .await
            .map_err(anyhow::Error::new)?;
        Ok(height.as_u64())
    }

    async fn syncing(&self) -> Result<bool> {
        let status = self.inner.syncing().await.map_err(anyhow::Error::new)?;
        Ok(matches!(status, SyncingStatus::IsSyncing(_)))
    }

    async fn pending_nonce(&self, account: Address) -> Result<U256> {
        self.inner
            .get_transaction_count(account, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .map_err(anyhow::Error::new)
    }

    async fn suggest_gas_price(&self) -> Result<U256> {
        self.inner.get_gas_price().await.map_err(anyhow::Error::new)
    }

    async fn chain_id(&self) -> Result<U256> {
        self.inner.get_chainid().await.map_err(anyhow::Error::new)
    }
}

struct EthersOracleContract {
    inner: OracleContractBinding<WsClient>,
}

#[async_trait]
impl OracleContract for EthersOracleContract {
    async fn get_round(&self) -> Result<u64> {
        let round = self.inner.get_round().call().await.map_err(contract_err)?;
        Ok(round.as_u64())
    }

    async fn get_symbols(&self) -> Result<Vec<String>> {
        self.inner.get_symbols().call().await.map_err(contract_err)
    }

    async fn get_committee(&self) -> Result<Vec<Address>> {
        self.inner
            .get_committee()
            .call()
            .await
            .map_err(contract_err)
    }

    async fn vote(&self, tx: VoteTx) -> Result<H256> {
        // the signer middleware already carries the chain id read at dial time
        let mut call = self
            .inner
            .vote(
                tx.commitment,
                tx.votes.unwrap_or_default(),
                tx.salt.unwrap_or_default(),
            )
            .legacy()
            .gas_price(tx.gas_price)
            .gas(tx.gas_limit);
        call.tx.set_nonce(tx.nonce);
        let pending = call.send().await.map_err(contract_err)?;
        Ok(*pending)
    }
}

fn contract_err(e: ContractError<WsClient>) -> anyhow::Error {
    anyhow::Error::new(e)
}
