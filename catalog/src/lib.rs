pub mod catalog;
pub mod cron;
pub mod snapshot;
pub mod source;
pub mod table;

pub use catalog::Catalog;
pub use cron::Cron;
pub use source::{RowSource, VecRowSource};
pub use table::TableState;
