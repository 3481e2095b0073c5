mod migration;
mod operation;
mod types;

pub use migration::{MigrationScript, OperationSet};
pub use operation::{ColumnDef, ForeignKeyDef, Operation, PrimaryKeyDef, ReferentialAction};
pub use types::{ColumnType, Value};
