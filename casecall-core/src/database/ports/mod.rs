pub mod call_cases;
pub mod due_cases;
pub mod sync_connections;

pub use call_cases::*;
pub use due_cases::*;
pub use sync_connections::*;
