//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `run`    | `Run`            |
//! | `watch`  | `Watch`          |
//! | `config` | `Config`         |

pub mod config;
pub mod run;
pub mod serve;
pub mod watch;

pub use config::cmd_config;
pub use run::cmd_run;
pub use serve::cmd_serve;
pub use watch::cmd_watch;
