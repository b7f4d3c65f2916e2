/// User-facing surface for install outcomes. Formatting lives with the implementor.
pub trait Notifier: Send + Sync {
    fn install_succeeded(&self, package_name: &str, display_name: &str, updated: bool);
    fn install_failed(&self, package_name: &str, display_name: &str, message: &str);
    /// The OS needs the user to confirm; `confirmation` is its opaque handle.
    fn user_action_required(&self, package_name: &str, confirmation: Option<&str>);
}

/// Headless notifier: outcomes go to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn install_succeeded(&self, package_name: &str, display_name: &str, updated: bool) {
        let verb = if updated { "updated" } else { "installed" };
        tracing::info!("{} {} ({})", display_name, verb, package_name);
    }

    fn install_failed(&self, package_name: &str, display_name: &str, message: &str) {
        tracing::warn!("{} ({}) failed to install: {}", display_name, package_name, message);
    }

    fn user_action_required(&self, package_name: &str, confirmation: Option<&str>) {
        tracing::info!(
            "install of {} awaits user confirmation {}",
            package_name,
            confirmation.unwrap_or("-")
        );
    }
}
