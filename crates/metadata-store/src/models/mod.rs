pub mod item;

pub use item::{HydrationInfo, ItemRecord, UploadCheckpoint};
