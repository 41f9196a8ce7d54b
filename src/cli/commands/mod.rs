//! CLI command implementations

pub mod explain;
pub mod forget;
pub mod run;

pub use explain::execute as explain;
pub use forget::execute as forget;
pub use run::execute as run;
