//! Pooling for reusable read buffers.
//!
//! Each reactor owns its pool, so checked-out objects never cross threads;
//! re-homing a connection to another reactor goes through the dispatcher
//! pipe, never through a shared pool. Dropping a [`PooledObject`] returns it
//! to its pool after the reset hook runs.

use std::sync::mpsc as channel;
use std::sync::{Arc, Mutex};

pub struct ObjectPool<T> {
    sender: channel::Sender<T>,
    receiver: Arc<Mutex<channel::Receiver<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    reset_fn: Arc<dyn Fn(&mut T) + Send + Sync>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: Arc::clone(&self.receiver),
            create_fn: Arc::clone(&self.create_fn),
            reset_fn: Arc::clone(&self.reset_fn),
        }
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new<F>(initial_size: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_reset(initial_size, create_fn, |_| {})
    }

    /// A pool whose objects are passed through `reset_fn` on every acquire,
    /// so callers always see a clean object regardless of its history.
    pub fn with_reset<F, R>(initial_size: usize, create_fn: F, reset_fn: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let (sender, receiver) = channel::channel();
        for _ in 0..initial_size {
            sender
                .send(create_fn())
                .expect("freshly created pool channel cannot be closed");
        }
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            create_fn: Arc::new(create_fn),
            reset_fn: Arc::new(reset_fn),
        }
    }

    /// Checks an object out, creating a fresh one when the pool is empty.
    pub fn acquire(&self) -> PooledObject<T> {
        let mut object = {
            let receiver = self.receiver.lock().unwrap();
            match receiver.try_recv() {
                Ok(object) => object,
                Err(_) => (self.create_fn)(),
            }
        };
        (self.reset_fn)(&mut object);
        PooledObject {
            object: Some(object),
            pool_sender: self.sender.clone(),
        }
    }
}

pub struct PooledObject<T> {
    object: Option<T>,
    pool_sender: channel::Sender<T>,
}

impl<T> std::ops::Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("live until drop")
    }
}

impl<T> std::ops::DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("live until drop")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            // If the pool is gone the object is simply dropped.
            let _ = self.pool_sender.send(object);
        }
    }
}
