#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut regions = lock!(self.regions);
///  regions.insert(address, region);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let regions = read_lock!(self.regions);
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut regions = write_lock!(self.regions);
///  regions.push(region);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock.write().expect("Failed to acquire write lock")
    };
}

/// Helper macro for running a closure against a locked item
///
/// ```rust, ignore
///  let count = with_lock!(self.regions, |regions| regions.len());
/// ```
macro_rules! with_lock {
    ($lock:expr, $closure:expr) => {{
        let mut guard = $lock.lock().expect("Failed to acquire lock");
        $closure(&mut *guard)
    }};
}
