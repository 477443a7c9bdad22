pub mod auth;
pub use auth::AuthRequest;

pub mod deployments;
pub use deployments::{Deployment, DeploymentStatus};

pub mod inventory;
pub use inventory::InventoryAttribute;
