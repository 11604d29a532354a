//! Sharding state: the gate in front of every sharded command
//!
//! ```text
//! New --initialize--> Initialized(identity)
//!  \
//!   `--fail-------> Error(reason)
//! ```
//!
//! Both `Initialized` and `Error` are terminal outside of tests.

use crate::common::{Error, OperationContext, Result};
use crate::sharding::local_store::{LocalMetadataStore, ShardIdentity};
use crate::sharding::metadata_cache::MetadataCache;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    New,
    Initialized(ShardIdentity),
    Error(String),
}

impl InitState {
    pub fn name(&self) -> &'static str {
        match self {
            InitState::New => "new",
            InitState::Initialized(_) => "initialized",
            InitState::Error(_) => "error",
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, InitState::New)
    }
}

/// Shard identity and initialization state
#[derive(Debug)]
pub struct ShardingState {
    state: Mutex<InitState>,
    /// Flips to true once the state is terminal
    terminal: watch::Sender<bool>,
}

impl Default for ShardingState {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardingState {
    pub fn new() -> Self {
        let (terminal, _) = watch::channel(false);
        Self {
            state: Mutex::new(InitState::New),
            terminal,
        }
    }

    pub fn state(&self) -> InitState {
        self.state.lock().clone()
    }

    pub fn enabled(&self) -> bool {
        matches!(*self.state.lock(), InitState::Initialized(_))
    }

    /// Called at the top of every sharded command
    pub fn can_accept_sharded_commands(&self) -> Result<()> {
        match &*self.state.lock() {
            InitState::Initialized(_) => Ok(()),
            InitState::New => Err(Error::ShardingNotInitialized),
            InitState::Error(reason) => Err(Error::ShardingInitFailed(reason.clone())),
        }
    }

    pub fn identity(&self) -> Result<ShardIdentity> {
        match &*self.state.lock() {
            InitState::Initialized(identity) => Ok(identity.clone()),
            InitState::New => Err(Error::ShardingNotInitialized),
            InitState::Error(reason) => Err(Error::ShardingInitFailed(reason.clone())),
        }
    }

    pub fn shard_name(&self) -> Result<String> {
        self.identity().map(|i| i.shard_name)
    }

    pub fn cluster_id(&self) -> Result<Uuid> {
        self.identity().map(|i| i.cluster_id)
    }

    /// `New -> Initialized`. Re-initializing with the same identity is a
    /// no-op; a different identity is rejected.
    pub fn initialize(&self, identity: ShardIdentity) -> Result<()> {
        let mut state = self.state.lock();
        match &*state {
            InitState::New => {
                tracing::info!(
                    shard = %identity.shard_name,
                    cluster_id = %identity.cluster_id,
                    config_server = %identity.config_server,
                    "Sharding state initialized"
                );
                *state = InitState::Initialized(identity);
            }
            InitState::Initialized(current) if *current == identity => return Ok(()),
            InitState::Initialized(current) => {
                return Err(Error::InvalidOptions(format!(
                    "shard already initialized as {} in cluster {}",
                    current.shard_name, current.cluster_id
                )));
            }
            InitState::Error(reason) => return Err(Error::ShardingInitFailed(reason.clone())),
        }
        drop(state);
        self.terminal.send_replace(true);
        Ok(())
    }

    /// `New -> Error`
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        tracing::error!(%reason, "Sharding state initialization failed");
        *state = InitState::Error(reason);
        drop(state);
        self.terminal.send_replace(true);
    }

    /// Ingest the persisted identity. A store without an identity record
    /// leaves the state `New`; an unreadable one moves it to `Error`.
    pub fn initialize_from_store(&self, store: &LocalMetadataStore) -> Result<Option<ShardIdentity>> {
        match store.get_identity() {
            Ok(Some(identity)) => {
                self.initialize(identity.clone())?;
                Ok(Some(identity))
            }
            Ok(None) => {
                tracing::info!("No shard identity found, sharding stays uninitialized");
                Ok(None)
            }
            Err(e) => {
                self.fail(format!("failed to read shard identity: {}", e));
                Err(e)
            }
        }
    }

    /// Block until initialization reached a terminal state
    pub async fn wait_for_initialization(&self, ctx: &OperationContext) -> Result<ShardIdentity> {
        let mut rx = self.terminal.subscribe();
        ctx.run(async {
            rx.wait_for(|terminal| *terminal)
                .await
                .map(|_| ())
                .map_err(|_| Error::Internal("sharding state dropped".into()))
        })
        .await?;
        self.identity()
    }

    /// Refresh every collection the config service places on this shard,
    /// in the background
    pub fn prime_metadata_cache(
        &self,
        cache: Arc<MetadataCache>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        self.can_accept_sharded_commands()?;
        Ok(tokio::spawn(async move {
            let ctx = OperationContext::internal("prime-metadata-cache");
            let namespaces = match cache.list_shard_collections(&ctx).await {
                Ok(namespaces) => namespaces,
                Err(e) => {
                    tracing::warn!("Failed to list collections for cache priming: {}", e);
                    return;
                }
            };

            for ns in namespaces {
                match cache.refresh_metadata_now(&ctx, &ns).await {
                    Ok(version) => tracing::debug!(%ns, %version, "Primed metadata"),
                    Err(e) => tracing::warn!(%ns, "Failed to prime metadata: {}", e),
                }
            }
        }))
    }

    pub fn set_initialized_for_test(&self, identity: ShardIdentity) {
        *self.state.lock() = InitState::Initialized(identity);
        self.terminal.send_replace(true);
    }

    pub fn reset_for_test(&self) {
        *self.state.lock() = InitState::New;
        self.terminal.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(name: &str) -> ShardIdentity {
        ShardIdentity {
            shard_name: name.to_string(),
            cluster_id: Uuid::new_v4(),
            config_server: "config/localhost:27019".to_string(),
        }
    }

    #[test]
    fn test_new_rejects_sharded_commands() {
        let state = ShardingState::new();
        assert!(matches!(
            state.can_accept_sharded_commands(),
            Err(Error::ShardingNotInitialized)
        ));
        assert_eq!(state.state().name(), "new");
    }

    #[test]
    fn test_initialize_is_one_way() {
        let state = ShardingState::new();
        let id = identity("shard0000");
        state.initialize(id.clone()).unwrap();
        state.can_accept_sharded_commands().unwrap();
        assert_eq!(state.shard_name().unwrap(), "shard0000");

        state.initialize(id).unwrap();
        assert!(state.initialize(identity("shard0001")).is_err());

        state.fail("late failure");
        assert!(state.enabled());
    }

    #[test]
    fn test_error_state_reports_reason() {
        let state = ShardingState::new();
        state.fail("bad identity document");
        match state.can_accept_sharded_commands() {
            Err(Error::ShardingInitFailed(reason)) => assert_eq!(reason, "bad identity document"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(state.initialize(identity("shard0000")).is_err());
    }

    #[tokio::test]
    async fn test_waiters_wake_on_initialize() {
        let state = Arc::new(ShardingState::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                let ctx = OperationContext::new("test").with_timeout(Duration::from_secs(5));
                state.wait_for_initialization(&ctx).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.initialize(identity("shard0000")).unwrap();
        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id.shard_name, "shard0000");
    }

    #[tokio::test]
    async fn test_wait_times_out_while_new() {
        let state = ShardingState::new();
        let ctx = OperationContext::new("test").with_timeout(Duration::from_millis(20));
        let err = state.wait_for_initialization(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::ExceededTimeLimit));
    }

    #[test]
    fn test_reset_for_test() {
        let state = ShardingState::new();
        state.set_initialized_for_test(identity("shard0000"));
        assert!(state.enabled());
        state.reset_for_test();
        assert_eq!(state.state(), InitState::New);
    }
}
