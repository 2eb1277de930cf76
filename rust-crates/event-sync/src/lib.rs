pub mod app;

pub mod snapshot;

pub mod events;

pub mod transform;

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
