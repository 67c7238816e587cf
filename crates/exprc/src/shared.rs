use std::sync::Arc;

/// Shared ownership handle used throughout the crate.
pub type Shared<T> = Arc<T>;
/// Interior-mutability cell for runtime objects touched from multiple threads.
pub type SharedCell<T> = parking_lot::RwLock<T>;

pub fn shared_cell<T>(value: T) -> Shared<SharedCell<T>> {
    Shared::new(SharedCell::new(value))
}
