// Domain-layer modules and shared errors/models
pub mod enrichment {
    pub use crate::enrichment::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod task_queue {
    pub use crate::task_queue::*;
}

pub mod errors {
    pub use crate::errors::*;
}
