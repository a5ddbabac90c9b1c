use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use fedkube::client::KubeClient;
use fedkube::kube::cache::ObjectCache;
use fedkube::kube::store::ObjectStore;
use fedkube::kube::types::QualifiedName;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::info;

use crate::config::configuration::{Config, FederatedTypeConfig, ResourceConfig, load_config};
use crate::context::{Context, FederatedType};
use crate::federation::informer::FederatedInformer;
use crate::federation::membership::MemberClusters;
use crate::metrics::setup_metrics_exporter;
use crate::status::controller::{StatusController, StatusSources, StatusTiming};
use crate::tracing::setup_tracing;
use crate::version::manager::VersionManager;

#[derive(Debug)]
pub struct ContextBuilder {
    config: Config,
}

struct Components {
    types: Vec<FederatedType>,
    handles: Vec<AbortOnDropHandle<()>>,
}

impl ContextBuilder {
    pub fn new(config: Config) -> Self {
        setup_tracing(config.log_level.clone());
        ContextBuilder { config }
    }

    /// Load the configuration from the environment and initializes context builder
    pub fn from_cli() -> Result<Self> {
        let config = load_config()?;
        Ok(ContextBuilder::new(config))
    }

    pub fn try_build_and_start(&self) -> Result<Context> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("fed-controller")
            .build()
            .expect("Federation controller tokio runtime");

        let cancellation = CancellationToken::new();
        let components = runtime.block_on(async {
            ContextBuilder::init(&self.config, cancellation.clone())
                .await
                .context("failed to initialize federation controller")
        })?;

        Ok(Context::new(
            self.config.clone(),
            components.types,
            components.handles,
            cancellation,
            runtime,
        ))
    }

    async fn init(config: &Config, cancelation: CancellationToken) -> Result<Components> {
        let host = KubeClient::build(&config.kubernetes)
            .await
            .context("failed to connect to host cluster")?;

        let mut member_clients = BTreeMap::new();
        for cluster in &config.clusters {
            let client = KubeClient::build(&cluster.kube_configuration())
                .await
                .with_context(|| format!("failed to configure member cluster {}", cluster.name))?;
            member_clients.insert(cluster.name.to_owned(), client);
        }
        let members = Arc::new(MemberClusters::new(member_clients));

        let mut types = vec![];
        let mut handles = vec![];
        if let Some(address) = config.controller.metrics_address {
            handles.push(setup_metrics_exporter(address)?);
        }
        for type_config in &config.types {
            let namespace = config.controller.target_namespace.to_owned();
            let version_manager = Arc::new(VersionManager::new(
                Arc::new(host.clone()),
                type_config.namespaced,
                type_config.federated.kind.to_owned(),
                type_config.target.kind.to_owned(),
                namespace.clone(),
            ));
            handles.push(AbortOnDropHandle::new(tokio::spawn({
                let version_manager = version_manager.clone();
                let cancelation = cancelation.child_token();
                async move { version_manager.sync(cancelation).await }
            })));

            let federated_ar = host
                .resolve(&type_config.federated.get_gvk())
                .await
                .with_context(|| format!("failed to resolve {}", type_config.federated.kind))?;
            let (federated_tx, federated_rx) = loole::unbounded();
            let federated_cache = Arc::new(ObjectCache::start(
                host.clone(),
                federated_ar,
                namespace,
                federated_tx,
                cancelation.child_token(),
            ));

            let object_changes = match &type_config.status {
                Some(status) => {
                    let (object_tx, controller_handles) = ContextBuilder::start_status_controller(
                        config,
                        type_config,
                        status,
                        &host,
                        &members,
                        federated_cache.clone(),
                        cancelation.clone(),
                    )
                    .await
                    .with_context(|| {
                        format!(
                            "failed to start status controller for {}",
                            type_config.federated.kind
                        )
                    })?;
                    handles.extend(controller_handles);
                    Some(object_tx)
                }
                None => None,
            };
            handles.push(version_manager.track_deletions(
                federated_cache,
                federated_rx,
                object_changes,
                cancelation.child_token(),
            ));

            types.push(FederatedType {
                config: type_config.clone(),
                version_manager,
            });
        }

        // Lifecycle handlers are registered, health probes can start.
        handles.push(members.start(
            config.controller.cluster_health_check_period(),
            cancelation.child_token(),
        ));

        Ok(Components { types, handles })
    }

    /// Returns the sender for federated object changes together with the
    /// controller's task handles.
    async fn start_status_controller(
        config: &Config,
        type_config: &FederatedTypeConfig,
        status: &ResourceConfig,
        host: &KubeClient,
        members: &Arc<MemberClusters>,
        federated_cache: Arc<ObjectCache>,
        cancelation: CancellationToken,
    ) -> Result<(loole::Sender<QualifiedName>, Vec<AbortOnDropHandle<()>>)> {
        let namespace = config.controller.target_namespace.to_owned();
        let status_ar = host.resolve(&status.get_gvk()).await?;
        let (object_tx, object_rx) = loole::unbounded();
        let (target_tx, target_rx) = loole::unbounded();

        let status_cache = ObjectCache::start(
            host.clone(),
            status_ar.clone(),
            namespace.clone(),
            object_tx.clone(),
            cancelation.child_token(),
        );
        let informer = Arc::new(FederatedInformer::new(
            members.clone(),
            type_config.target.get_gvk(),
            namespace,
            target_tx,
            cancelation.child_token(),
        ));

        let states = members.states();
        let client: Arc<dyn ObjectStore> = Arc::new(host.clone());
        let controller = Arc::new(StatusController::new(
            type_config.federated.kind.to_owned(),
            status_ar,
            StatusSources {
                federated: federated_cache,
                status: Arc::new(status_cache),
                membership: states.clone(),
                targets: informer.clone(),
            },
            client,
            StatusTiming::from_config(&config.controller),
            config.controller.max_concurrent_status_reconciles,
        ));

        // Target caches have to exist before the sweep triggered by the same
        // cluster event runs.
        states.add_handler(informer);
        states.add_handler(controller.clone());

        info!(
            "Collecting {} status into {}",
            type_config.federated.kind, status.kind
        );
        let handles = controller.run(object_rx, target_rx, cancelation.child_token());
        Ok((object_tx, handles))
    }
}
