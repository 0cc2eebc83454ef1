//! Typed wrapper over the byte-oriented store.

use std::marker::PhantomData;

use strata_types::StoreConfig;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result, SequenceNumber},
    operation::RedoUndo,
    store::Store,
    types::{Key, Value},
};

/// A [`Store`] whose keys and values are Rust types.
///
/// Opening forces `key_comparison.data_type` to `K::DATA_TYPE`, so the
/// store orders keys the way `K` orders them.
///
/// # Example
///
/// ```no_run
/// # use strata_store::{TypedStore, Result};
/// # use strata_types::{StorageConfig, StoreConfig};
/// # use tokio_util::sync::CancellationToken;
/// # async fn example() -> Result<()> {
/// let config = StoreConfig { storage: StorageConfig::volatile(), ..StoreConfig::default() };
/// let store = TypedStore::<i64, String>::open(config, false).await?;
/// let cancel = CancellationToken::new();
/// store.insert(&-5, &"minus five".to_string(), 1, &cancel).await?;
/// assert_eq!(store.seek(&-5, &cancel).await?, "minus five");
/// # Ok(())
/// # }
/// ```
pub struct TypedStore<K, V> {
    store: Store,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedStore<K, V> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), _marker: PhantomData }
    }
}

impl<K, V> std::fmt::Debug for TypedStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TypedStore").field(&self.store).finish()
    }
}

fn decode_value<V: Value>(bytes: &[u8]) -> Result<V> {
    V::decode(bytes).ok_or_else(|| Error::Corrupted {
        reason: format!("stored value does not decode as {}", std::any::type_name::<V>()),
    })
}

impl<K: Key, V: Value> TypedStore<K, V> {
    /// Opens a store keyed by `K`.
    ///
    /// # Errors
    ///
    /// Same as [`Store::open`].
    pub async fn open(mut config: StoreConfig, storage_exists: bool) -> Result<Self> {
        config.key_comparison.data_type = K::DATA_TYPE;
        if let Some(width) = K::DATA_TYPE.fixed_width() {
            config.key_comparison.max_key_size_bytes =
                config.key_comparison.max_key_size_bytes.max(width);
        }
        Ok(Self::wrap(Store::open(config, storage_exists).await?))
    }

    /// Wraps an open store. The caller guarantees its key type matches `K`.
    pub fn wrap(store: Store) -> Self {
        Self { store, _marker: PhantomData }
    }

    /// The underlying byte-oriented store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// See [`Store::insert`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyExists`] if the key is present.
    pub async fn insert(
        &self,
        key: &K,
        value: &V,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<RedoUndo> {
        self.store.insert(&key.to_key_bytes(), &value.to_value_bytes(), sequence, cancel).await
    }

    /// See [`Store::upsert`]. Returns the prior value, if any.
    ///
    /// # Errors
    ///
    /// Returns sequencing and lifecycle errors.
    pub async fn upsert(
        &self,
        key: &K,
        value: &V,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Option<V>, RedoUndo)> {
        let (prior, records) = self
            .store
            .upsert(&key.to_key_bytes(), &value.to_value_bytes(), sequence, cancel)
            .await?;
        Ok((prior.map(|bytes| decode_value(&bytes)).transpose()?, records))
    }

    /// See [`Store::update_with_output`]. Returns the prior value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn update(
        &self,
        key: &K,
        value: &V,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(V, RedoUndo)> {
        let (prior, records) = self
            .store
            .update_with_output(&key.to_key_bytes(), &value.to_value_bytes(), sequence, cancel)
            .await?;
        Ok((decode_value(&prior)?, records))
    }

    /// See [`Store::delete_with_output`]. Returns the removed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn delete(
        &self,
        key: &K,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(V, RedoUndo)> {
        let (prior, records) =
            self.store.delete_with_output(&key.to_key_bytes(), sequence, cancel).await?;
        Ok((decode_value(&prior)?, records))
    }

    /// See [`Store::seek`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent, or
    /// [`Error::Corrupted`] if the stored bytes do not decode as `V`.
    pub async fn seek(&self, key: &K, cancel: &CancellationToken) -> Result<V> {
        let bytes = self.store.seek(&key.to_key_bytes(), cancel).await?;
        decode_value(&bytes)
    }

    /// Like [`seek`](Self::seek), mapping a missing key to `None`.
    ///
    /// # Errors
    ///
    /// Returns every error of [`seek`](Self::seek) except `KeyNotFound`.
    pub async fn get(&self, key: &K, cancel: &CancellationToken) -> Result<Option<V>> {
        match self.seek(key, cancel).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_key_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every `(key, value)` pair in key order, read from one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a stored key or value does not decode.
    pub async fn entries(&self, cancel: &CancellationToken) -> Result<Vec<(K, V)>> {
        let scan = self.store.create_scan()?;
        scan.open(None, None, None, true, cancel).await?;
        let mut out = Vec::new();
        while let Some(position) = scan.move_next(cancel).await? {
            let key = K::decode(&position.key).ok_or_else(|| Error::Corrupted {
                reason: format!("stored key does not decode as {}", std::any::type_name::<K>()),
            })?;
            let value = decode_value(position.value.as_deref().unwrap_or_default())?;
            out.push((key, value));
        }
        scan.close()?;
        Ok(out)
    }
}
