pub mod consts;
pub mod error;
pub mod types;

pub use consts::*;
pub use error::OracleError;
pub use types::AccountId;
