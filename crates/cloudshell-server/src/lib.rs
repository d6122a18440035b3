pub mod bridge;
pub mod protocol;
pub mod settings;
pub mod shell;
pub mod upload;
pub mod ws;

pub use bridge::{NotReadyPolicy, SessionContext, run_session};
pub use settings::ServerSettings;
pub use shell::{PtyLauncher, Shell, ShellLauncher};
pub use ws::{ServerState, router};
