pub mod context;
pub mod key;
pub mod remote;
pub mod team;

mod init;
mod prompt;
mod pull;
mod push;
mod restore;
mod status;

pub use init::init;
pub use pull::pull;
pub use push::push;
pub use restore::restore;
pub use status::status;
