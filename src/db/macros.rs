//! Backend dispatch macros.
//!
//! These expand to a `match` over [`DbPool`](crate::db::pool::DbPool) so that
//! per-backend code stays linear and the variant list lives in one place.

/// Generate the match arms for each `DbPool` variant.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => mysql::run(p).await,
///     Postgres(p) => postgres::run(p).await,
///     SQLite(p) => sqlite::run(p).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Same body for every backend, where the code is generic over the driver.
#[macro_export]
macro_rules! db_dispatch_all {
    ($pool:expr, |$p:ident| $body:expr) => {
        $crate::impl_db_dispatch!($pool, {
            MySql($p) => $body,
            Postgres($p) => $body,
            SQLite($p) => $body,
        })
    };
}

pub use db_dispatch_all;
pub use impl_db_dispatch;
