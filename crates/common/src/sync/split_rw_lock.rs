//! A reader/writer pair sharing one `RwLock`, where only the `Writer` half
//! can take the write lock. Splitting the capability this way means a
//! function that only needs to read a piece of shared state can declare
//! that in its signature (`reader: Reader<T>`) instead of `Arc<RwLock<T>>`,
//! which would let it (incorrectly) write too.

use std::sync::Arc;

use parking_lot::{
    RwLock,
    RwLockReadGuard,
    RwLockWriteGuard,
};

pub fn new_split_rw_lock<T>(value: T) -> (Reader<T>, Writer<T>) {
    let inner = Arc::new(RwLock::new(value));
    (Reader { inner: inner.clone() }, Writer { inner })
}

pub struct Reader<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Reader<T> {
    pub fn lock(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }
}

pub struct Writer<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Writer<T> {
    pub fn reader(&self) -> Reader<T> {
        Reader {
            inner: self.inner.clone(),
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }
}
