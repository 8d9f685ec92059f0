pub mod error;

pub use error::{
    AuthError, BootstrapError, BootstrapStep, DbError, MigrateError, Result, RetryError,
};
