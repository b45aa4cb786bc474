mod item_state;

pub use item_state::{ItemState, UnknownState};
