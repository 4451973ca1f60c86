pub mod checksum;
pub mod composer;
pub mod config;
pub mod counter;
pub mod deployment;
pub mod encryption;
pub mod error;
pub mod exclusion;
pub mod ftp_session;
pub mod index;
pub mod process;
pub mod purge;
pub mod scanner;
pub mod worker;

pub use config::Config;
pub use deployment::{Deployment, DeploymentOptions};
pub use error::{DeployError, Result};
