use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::{Datum, Schema};

/// Per-row-size slab allocator. Rows of the same arity recycle their
/// backing `Vec<Datum>` through a LIFO freelist instead of allocating
/// afresh on every `Tuple::make`; growth is left to `Vec`'s own doubling,
/// giving the same amortized behavior as a block-doubling pool without a
/// custom allocator.
pub struct TuplePool {
    arity: usize,
    freelist: Mutex<Vec<Vec<Datum>>>,
}

impl TuplePool {
    fn new(arity: usize) -> Self {
        TuplePool { arity, freelist: Mutex::new(Vec::new()) }
    }

    fn take_slot(&self) -> Vec<Datum> {
        self.freelist
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.arity))
    }

    fn return_slot(&self, mut slot: Vec<Datum>) {
        slot.clear();
        self.freelist.lock().unwrap_or_else(|e| e.into_inner()).push(slot);
    }
}

/// Process-wide row-size → `TuplePool` map. A single lazily-initialized
/// instance backs every `Client` in the process.
pub struct TuplePoolMgr {
    pools: Mutex<HashMap<usize, Arc<TuplePool>>>,
}

impl TuplePoolMgr {
    fn global() -> &'static TuplePoolMgr {
        static MGR: OnceLock<TuplePoolMgr> = OnceLock::new();
        MGR.get_or_init(|| TuplePoolMgr { pools: Mutex::new(HashMap::new()) })
    }

    fn pool_for(arity: usize) -> Arc<TuplePool> {
        let mgr = Self::global();
        let mut pools = mgr.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.entry(arity).or_insert_with(|| Arc::new(TuplePool::new(arity))).clone()
    }
}

struct TupleInner {
    schema: Arc<Schema>,
    values: Vec<Datum>,
    pool: Arc<TuplePool>,
}

impl Drop for TupleInner {
    fn drop(&mut self) {
        let slot = std::mem::take(&mut self.values);
        self.pool.return_slot(slot);
    }
}

/// Refcounted, immutable-after-construction row. Cloning a `Tuple` is the
/// "pin" operation (bumps the `Arc` strong count); dropping the last
/// handle is "unpin" and returns the row's backing storage to its
/// `TuplePool`.
#[derive(Clone)]
pub struct Tuple(Arc<TupleInner>);

impl Tuple {
    /// Constructs a new tuple, validating arity against `schema`.
    ///
    /// # Panics
    /// Panics if `values.len() != schema.arity()` — a mismatch here means
    /// a planner or operator bug (`InvariantViolation`), not malformed
    /// input, since schema conformance is established earlier in the
    /// pipeline.
    pub fn make(schema: Arc<Schema>, values: Vec<Datum>) -> Tuple {
        assert_eq!(values.len(), schema.arity(), "tuple arity mismatch");
        let pool = TuplePoolMgr::pool_for(schema.arity());
        let mut slot = pool.take_slot();
        slot.extend(values);
        Tuple(Arc::new(TupleInner { schema, values: slot, pool }))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.0.schema
    }

    pub fn arity(&self) -> usize {
        self.0.values.len()
    }

    pub fn get(&self, i: usize) -> &Datum {
        &self.0.values[i]
    }

    pub fn values(&self) -> &[Datum] {
        &self.0.values
    }

    /// Explicit pin, for symmetry with call sites that follow a
    /// pin/unpin pairing (e.g. handing a tuple to a send buffer while it
    /// also remains referenced by a table).
    pub fn pin(&self) -> Tuple {
        self.clone()
    }

    /// This tuple's location-specifier column value, if its schema marks
    /// one.
    pub fn loc_spec(&self) -> Option<&str> {
        let col = self.0.schema.loc_spec_col()?;
        self.get(col).as_str()
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        if self.0.values.len() != other.0.values.len() {
            return false;
        }
        self.0
            .values
            .iter()
            .zip(other.0.values.iter())
            .all(|(a, b)| super::datum_equal(a, b))
    }
}
impl Eq for Tuple {}

impl std::hash::Hash for Tuple {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for v in &self.0.values {
            super::datum_hash(v, state);
        }
    }
}

impl std::fmt::Debug for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tuple").field(&self.0.values).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![DataType::I8, DataType::I8], None))
    }

    #[test]
    fn make_and_read_back_values() {
        let t = Tuple::make(schema(), vec![Datum::I8(1), Datum::I8(2)]);
        assert_eq!(t.arity(), 2);
        assert!(matches!(t.get(0), Datum::I8(1)));
    }

    #[test]
    fn equal_tuples_compare_equal() {
        let a = Tuple::make(schema(), vec![Datum::I8(1), Datum::I8(2)]);
        let b = Tuple::make(schema(), vec![Datum::I8(1), Datum::I8(2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn pin_bumps_refcount_and_drop_releases_it() {
        let a = Tuple::make(schema(), vec![Datum::I8(1), Datum::I8(2)]);
        assert_eq!(a.strong_count(), 1);
        let b = a.pin();
        assert_eq!(a.strong_count(), 2);
        drop(b);
        assert_eq!(a.strong_count(), 1);
    }

    #[test]
    #[should_panic]
    fn make_panics_on_arity_mismatch() {
        Tuple::make(schema(), vec![Datum::I8(1)]);
    }
}
