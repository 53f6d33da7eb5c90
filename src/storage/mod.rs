pub mod context;
pub mod key;
pub mod resolve;

pub use context::{Context, MetadataContext, VersionedContext};
pub use key::{KeyClass, PhysicalKey};
pub use resolve::{ReadResolver, Visible};
