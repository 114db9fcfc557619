use std::marker::PhantomData;

use crate::errors::PoolError;

/// Number of instances built up front when no size is given.
pub const DEFAULT_INITIAL_SIZE: usize = 1000;

/// Acquire/release contract shared by every pool.
///
/// `release` is an ownership transfer: the caller gives the value back and
/// must not keep using it.
pub trait Pool<T> {
    fn acquire(&mut self) -> Result<T, PoolError>;
    fn release(&mut self, obj: T);
}

/// Values that bind resources while checked out of a [`CheckablePool`].
pub trait Checkable {
    /// Where the per-acquisition resources come from.
    type Source;

    /// Runs right after the value leaves the pool.
    fn check_out(&mut self, source: &mut Self::Source) -> Result<(), PoolError>;

    /// Runs right before the value goes back into the pool.
    fn check_in(&mut self, source: &mut Self::Source);
}

type Factory<T> = Box<dyn FnMut() -> Result<T, PoolError> + Send>;

/// Generic object pool for reusable objects
///
/// Not synchronized: it is owned by a single task and mutated through `&mut`.
/// Dropping the pool drops every idle instance, which releases whatever
/// resources they own.
pub struct ObjectPool<T> {
    pool: Vec<T>,
    create_fn: Factory<T>,
}

impl<T> ObjectPool<T> {
    /// Build a pool pre-filled with [`DEFAULT_INITIAL_SIZE`] instances.
    pub fn new<F>(create_fn: F) -> Result<Self, PoolError>
    where
        F: FnMut() -> Result<T, PoolError> + Send + 'static,
    {
        Self::with_initial_size(create_fn, DEFAULT_INITIAL_SIZE)
    }

    /// Build a pool and invoke the factory `initial_size` times right away.
    pub fn with_initial_size<F>(create_fn: F, initial_size: usize) -> Result<Self, PoolError>
    where
        F: FnMut() -> Result<T, PoolError> + Send + 'static,
    {
        let mut pool = Self {
            pool: Vec::with_capacity(initial_size),
            create_fn: Box::new(create_fn),
        };
        pool.warm(initial_size)?;
        Ok(pool)
    }

    /// Number of idle instances
    pub fn size(&self) -> usize {
        self.pool.len()
    }

    /// Pre-populate the pool with `count` more instances
    pub fn warm(&mut self, count: usize) -> Result<(), PoolError> {
        self.pool.reserve(count);
        for _ in 0..count {
            let obj = (self.create_fn)()?;
            self.pool.push(obj);
        }
        Ok(())
    }
}

impl<T> Pool<T> for ObjectPool<T> {
    /// Pop an idle instance, or build a new one if none is left.
    fn acquire(&mut self) -> Result<T, PoolError> {
        match self.pool.pop() {
            Some(obj) => Ok(obj),
            None => (self.create_fn)(),
        }
    }

    fn release(&mut self, obj: T) {
        self.pool.push(obj);
    }
}

/// Wraps a pool so every acquire runs [`Checkable::check_out`] and every
/// release runs [`Checkable::check_in`] against a shared resource source.
pub struct CheckablePool<P, T: Checkable> {
    origin: P,
    source: T::Source,
    _marker: PhantomData<fn() -> T>,
}

impl<P, T> CheckablePool<P, T>
where
    P: Pool<T>,
    T: Checkable,
{
    pub fn new(origin: P, source: T::Source) -> Self {
        Self {
            origin,
            source,
            _marker: PhantomData,
        }
    }

    pub fn origin(&self) -> &P {
        &self.origin
    }

    pub fn source(&self) -> &T::Source {
        &self.source
    }
}

impl<P, T> Pool<T> for CheckablePool<P, T>
where
    P: Pool<T>,
    T: Checkable,
{
    fn acquire(&mut self) -> Result<T, PoolError> {
        let mut obj = self.origin.acquire()?;
        if let Err(err) = obj.check_out(&mut self.source) {
            self.origin.release(obj);
            return Err(err);
        }
        Ok(obj)
    }

    fn release(&mut self, mut obj: T) {
        obj.check_in(&mut self.source);
        self.origin.release(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_pool(initial: usize) -> (ObjectPool<usize>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let pool = ObjectPool::with_initial_size(
            move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
            initial,
        )
        .unwrap();
        (pool, built)
    }

    #[test]
    fn prefill_invokes_factory_up_front() {
        let (pool, built) = counting_pool(4);
        assert_eq!(built.load(Ordering::SeqCst), 4);
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn default_prefill_size() {
        let pool = ObjectPool::new(|| Ok(0u8)).unwrap();
        assert_eq!(pool.size(), DEFAULT_INITIAL_SIZE);
    }

    #[test]
    fn acquire_reuses_before_building() {
        let (mut pool, built) = counting_pool(1);
        let first = pool.acquire().unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);

        // Empty stack falls back to the factory.
        let second = pool.acquire().unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_ne!(first, second);

        pool.release(first);
        assert_eq!(pool.acquire().unwrap(), first);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn factory_errors_propagate() {
        let mut left = 2;
        let mut pool = ObjectPool::with_initial_size(
            move || {
                if left == 0 {
                    return Err(PoolError::Capacity { capacity: 2 });
                }
                left -= 1;
                Ok(left)
            },
            2,
        )
        .unwrap();

        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert_eq!(pool.acquire(), Err(PoolError::Capacity { capacity: 2 }));

        let err = ObjectPool::with_initial_size(|| Err::<u8, _>(PoolError::Capacity { capacity: 0 }), 1);
        assert!(err.is_err());
    }

    #[derive(Default)]
    struct Lease {
        token: Option<usize>,
        checkouts: usize,
    }

    struct Tokens {
        free: Vec<usize>,
    }

    impl Checkable for Lease {
        type Source = Tokens;

        fn check_out(&mut self, source: &mut Tokens) -> Result<(), PoolError> {
            let token = source.free.pop().ok_or(PoolError::Capacity { capacity: 2 })?;
            self.token = Some(token);
            self.checkouts += 1;
            Ok(())
        }

        fn check_in(&mut self, source: &mut Tokens) {
            if let Some(token) = self.token.take() {
                source.free.push(token);
            }
        }
    }

    fn lease_pool() -> CheckablePool<ObjectPool<Lease>, Lease> {
        let leases = ObjectPool::with_initial_size(|| Ok(Lease::default()), 1).unwrap();
        CheckablePool::new(leases, Tokens { free: vec![0, 1] })
    }

    #[test]
    fn checkout_hook_reruns_on_reuse() {
        let mut pool = lease_pool();

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.checkouts, 1);
        assert!(lease.token.is_some());
        assert_eq!(pool.source().free.len(), 1);

        pool.release(lease);
        assert_eq!(pool.source().free.len(), 2);

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.checkouts, 2);
        assert!(lease.token.is_some());
    }

    #[test]
    fn failed_checkout_returns_instance_to_pool() {
        let mut pool = lease_pool();
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.origin().size(), 0);

        assert_eq!(pool.acquire().err(), Some(PoolError::Capacity { capacity: 2 }));
        assert_eq!(pool.origin().size(), 1);
        assert!(pool.source().free.is_empty());
    }
}
