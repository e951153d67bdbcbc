mod config_cmd;
mod export;
mod profile;
mod record;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use export::{ClearCommand, ExportCommand};
pub use profile::{ProfileCommand, ProfileSubcommand};
pub use record::{AddCommand, DeleteCommand, ListCommand, UpdateCommand};
pub use sync_cmd::SyncCommand;
