use std::fs;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::db::{self, Database};
use crate::errors::Result;
use crate::services::package_system::{callback_channel, CallbackReceiver, CallbackSender};
use crate::services::{
    ApiClient, AppStateReconciler, AuthService, CatalogService, CommandPackageSystem,
    DownloadQueueManager, DownloadWorker, EndpointResolver, HickorySrvLookup,
    InstallationController, JobRegistry, LogNotifier, Notifier, PackageSystem, SrvLookup,
    StatusEventBus, TokenManager,
};
use crate::utils::crypto::{load_or_create_key, SecretBox};
use crate::utils::file::FileManager;

/// Orchestration context built once per process and shared by clone.
#[derive(Clone)]
pub struct AgentState {
    pub config: AgentConfig,
    pub db: Database,
    pub files: FileManager,
    pub bus: StatusEventBus,
    pub endpoints: EndpointResolver,
    pub auth: AuthService,
    pub api: ApiClient,
    pub catalog: CatalogService,
    pub packages: Arc<dyn PackageSystem>,
    /// Inbound side of the package-signal channel, for OS adapters.
    pub signals: CallbackSender,
    pub installer: InstallationController,
    pub queue: DownloadQueueManager,
    pub reconciler: AppStateReconciler,
}

/// External collaborators, swappable for tests or other platforms.
pub struct Collaborators {
    pub lookup: Arc<dyn SrvLookup>,
    pub packages: Arc<dyn PackageSystem>,
    pub notifier: Arc<dyn Notifier>,
    pub signals: CallbackSender,
}

pub fn build_state(config: AgentConfig) -> Result<(AgentState, CallbackReceiver)> {
    fs::create_dir_all(&config.downloads_dir)?;
    let db = db::init(&config.root_dir)?;
    let key = load_or_create_key(&config.key_path())?;
    let secrets = SecretBox::new(&key)?;

    let (callbacks_tx, callbacks_rx) = callback_channel();
    let collaborators = Collaborators {
        lookup: Arc::new(HickorySrvLookup::from_system_conf()),
        packages: Arc::new(CommandPackageSystem::new(
            &config.install_command,
            &config.version_command,
            callbacks_tx.clone(),
        )),
        notifier: Arc::new(LogNotifier),
        signals: callbacks_tx,
    };

    Ok((assemble(config, db, secrets, collaborators), callbacks_rx))
}

pub fn assemble(
    config: AgentConfig,
    db: Database,
    secrets: SecretBox,
    collaborators: Collaborators,
) -> AgentState {
    let client = config.http_client();
    let files = FileManager::new(config.downloads_dir.clone());
    let bus = StatusEventBus::default();

    let endpoints = EndpointResolver::from_config(&config, collaborators.lookup);
    let tokens = TokenManager::new(db.clone(), secrets);
    let auth = AuthService::new(client.clone(), endpoints.clone(), tokens);
    let api = ApiClient::new(client.clone(), endpoints.clone(), auth.clone());
    let catalog = CatalogService::new(api.clone());

    let installer = InstallationController::new(
        db.clone(),
        files.clone(),
        collaborators.packages.clone(),
        bus.clone(),
        collaborators.notifier,
    );
    let worker = DownloadWorker::new(
        db.clone(),
        files.clone(),
        catalog.clone(),
        client,
        installer.clone(),
        config.download_attempts,
    );
    let queue = DownloadQueueManager::new(
        db.clone(),
        files.clone(),
        JobRegistry::new(),
        Arc::new(worker),
        config.queue_poll_interval,
    );
    let reconciler = AppStateReconciler::new(db.clone(), collaborators.packages.clone());

    AgentState {
        config,
        db,
        files,
        bus,
        endpoints,
        auth,
        api,
        catalog,
        packages: collaborators.packages,
        signals: collaborators.signals,
        installer,
        queue,
        reconciler,
    }
}

impl AgentState {
    /// Settles leftovers from the previous process, then starts the reconciler,
    /// the package-signal drain and the queue observer, in that order.
    pub fn start(&self, callbacks: CallbackReceiver) -> Result<Vec<JoinHandle<()>>> {
        let settled = self.queue.reconcile_on_startup()?;
        if !settled.is_empty() {
            tracing::warn!("startup reconciliation settled {} downloads", settled.len());
        }

        let reconciler = self.reconciler.spawn(&self.bus);
        let installer = self.installer.clone();
        let drain = tokio::spawn(async move { installer.run(callbacks).await });
        let observer = self.queue.spawn_observer();
        tracing::info!("download pipeline started");
        Ok(vec![reconciler, drain, observer])
    }

    /// Stops live transfers; rows stay active and are settled on next start.
    pub fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        for package_name in self.queue.registry().cancel_all() {
            tracing::info!("stopped transfer of {} for shutdown", package_name);
        }
        for task in tasks {
            task.abort();
        }
    }
}
