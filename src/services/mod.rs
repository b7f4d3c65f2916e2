pub mod api_client;
pub mod app_state;
pub mod auth_service;
pub mod catalog_service;
pub mod download_queue;
pub mod download_worker;
pub mod endpoint_resolver;
pub mod event_bus;
pub mod installation_controller;
pub mod job_registry;
pub mod notifier;
pub mod package_system;
pub mod token_manager;

pub use api_client::ApiClient;
pub use app_state::AppStateReconciler;
pub use auth_service::AuthService;
pub use catalog_service::CatalogService;
pub use download_queue::DownloadQueueManager;
pub use download_worker::{DownloadWorker, TransferJob};
pub use endpoint_resolver::{EndpointResolver, HickorySrvLookup, SrvLookup};
pub use event_bus::{EventSubscription, StatusEventBus};
pub use installation_controller::{InstallFailure, InstallOutcome, InstallationController};
pub use job_registry::{JobControl, JobRegistry};
pub use notifier::{LogNotifier, Notifier};
pub use package_system::{CommandPackageSystem, InstallRequest, PackageSystem};
pub use token_manager::TokenManager;
