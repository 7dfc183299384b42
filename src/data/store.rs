//! The id -> datum table and every operation on it.
//!
//! All operations run serially on the owning server's event-loop task, so
//! no interior locking exists here. Operations that can generate
//! notifications take a `&mut NotifSet` and append to it; delivering the
//! set is the server loop's job.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use crate::codec::value::{TypeExtra, Value};
use crate::codec::{vint, DataType};
use crate::data::notify::NotifSet;
use crate::layout::{Rank, NULL_ID};
use crate::msg::{CreateProps, DataError, EnumerateResult, RefCounts, RetrieveRc};
use crate::utils::env_boolean;

/// A single resident datum.
#[derive(Debug, Clone)]
pub struct Datum {
    pub dtype: DataType,
    /// `None` until the first top-level store; compound types are set at
    /// creation with their empty structure.
    pub storage: Option<Value>,
    pub read_refcount: i32,
    pub write_refcount: i32,
    pub permanent: bool,
    /// Worker ranks awaiting closure.
    pub listeners: Vec<Rank>,
    /// Opaque debug tag.
    pub symbol: u32,
}

/// Outcome of a refcount change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcOutcome {
    pub garbage_collected: bool,
    pub scavenged: RefCounts,
}

/// Per-server data store.
pub struct DataStore {
    tds: HashMap<i64, Datum>,

    /// `(container id, subscript)` -> datum ids bound by container-reference
    /// promises, to be written when the subscript is filled.
    container_references: HashMap<(i64, Vec<u8>), Vec<i64>>,

    /// `(container id, subscript)` -> ranks awaiting insertion.
    subscript_listeners: HashMap<(i64, Vec<u8>), Vec<Rank>>,

    /// Advisory locks: id -> holder rank.
    locked: HashMap<i64, Rank>,

    /// Number of servers; the id allocation stride.
    servers: i64,

    /// Next id to hand out. Strictly increasing, step `servers`.
    unique: i64,

    /// Hitting this means the id space is exhausted.
    last_id: i64,
}

impl DataStore {
    /// `servers`: cluster server count; `server_num`: my index among them.
    pub fn new(servers: i32, server_num: i32) -> Self {
        debug_assert!(server_num >= 0 && server_num < servers);
        let servers = servers as i64;
        let mut unique = server_num as i64;
        if unique == 0 {
            // id 0 is the null id
            unique += servers;
        }
        DataStore {
            tds: HashMap::new(),
            container_references: HashMap::new(),
            subscript_listeners: HashMap::new(),
            locked: HashMap::new(),
            servers,
            unique,
            last_id: i64::MAX - servers - 1,
        }
    }

    /// Hands out the next unused id of this server's sequence.
    pub fn unique(&mut self) -> Result<i64, DataError> {
        if self.unique >= self.last_id {
            return Err(DataError::Limit);
        }
        let id = self.unique;
        self.unique += self.servers;
        Ok(id)
    }

    /// Number of resident datums.
    pub fn resident(&self) -> usize {
        self.tds.len()
    }

    pub fn lookup(&self, id: i64) -> Result<&Datum, DataError> {
        self.tds.get(&id).ok_or(DataError::NotFound)
    }

    /// Creates a datum. Ids are caller-chosen here; the server allocates
    /// from `unique()` when the request carries the null id. Negative ids
    /// are legal (the checkpoint index lives there).
    pub fn create(
        &mut self,
        id: i64,
        dtype: DataType,
        type_extra: TypeExtra,
        props: CreateProps,
    ) -> Result<(), DataError> {
        if id == NULL_ID {
            return Err(DataError::Null);
        }
        if props.read_refcount < 0 || props.write_refcount < 0 {
            return Err(DataError::Invalid);
        }
        if self.tds.contains_key(&id) {
            pf_debug!("<{}> already exists", id);
            return Err(DataError::DoubleDeclare);
        }
        if props.read_refcount == 0 && props.write_refcount == 0 {
            pf_debug!("skipped creation of <{}>", id);
            return Ok(());
        }

        pf_debug!(
            "create <{}> t:{} r:{} w:{}",
            id,
            dtype.to_string_name(),
            props.read_refcount,
            props.write_refcount
        );

        // compound types are structurally set from the start
        let storage = match (dtype, type_extra) {
            (DataType::Container, TypeExtra::Container { key_type, val_type }) => {
                Some(Value::Container {
                    key_type,
                    val_type,
                    entries: BTreeMap::new(),
                })
            }
            (DataType::Container, _) => return Err(DataError::Type),
            (DataType::Multiset, TypeExtra::Multiset { val_type }) => Some(Value::Multiset {
                elem_type: val_type,
                elems: Vec::new(),
            }),
            (DataType::Multiset, _) => return Err(DataError::Type),
            _ => None,
        };

        self.tds.insert(
            id,
            Datum {
                dtype,
                storage,
                read_refcount: props.read_refcount,
                write_refcount: props.write_refcount,
                permanent: props.permanent,
                listeners: Vec::new(),
                symbol: props.symbol,
            },
        );
        Ok(())
    }

    pub fn exists(&self, id: i64, sub: Option<&[u8]>) -> Result<bool, DataError> {
        match sub {
            None => Ok(self.tds.get(&id).is_some_and(|d| d.storage.is_some())),
            Some(sub) => {
                let d = self.lookup(id)?;
                match &d.storage {
                    Some(Value::Container { entries, .. }) => Ok(entries.contains_key(sub)),
                    _ => Err(DataError::Type),
                }
            }
        }
    }

    pub fn typeof_(&self, id: i64) -> Result<DataType, DataError> {
        if id == NULL_ID {
            return Err(DataError::Null);
        }
        Ok(self.lookup(id)?.dtype)
    }

    pub fn container_typeof(&self, id: i64) -> Result<(DataType, DataType), DataError> {
        match &self.lookup(id)?.storage {
            Some(Value::Container {
                key_type, val_type, ..
            }) => Ok((*key_type, *val_type)),
            _ => Err(DataError::Type),
        }
    }

    /// Marks a datum permanent after the fact.
    pub fn permanent(&mut self, id: i64) -> Result<(), DataError> {
        self.tds
            .get_mut(&id)
            .ok_or(DataError::NotFound)?
            .permanent = true;
        Ok(())
    }

    /// Subscribes `rank` to closure of `id`, or to insertion at `sub`.
    /// Returns false when there is nothing to wait for (datum already
    /// closed, or subscript already filled).
    pub fn subscribe(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
        rank: Rank,
    ) -> Result<bool, DataError> {
        let d = self.tds.get_mut(&id).ok_or(DataError::NotFound)?;
        match sub {
            Some(sub) => {
                let filled = match &d.storage {
                    Some(Value::Container { entries, .. }) => {
                        matches!(entries.get(sub), Some(Some(_)))
                    }
                    _ => return Err(DataError::Invalid),
                };
                if filled {
                    return Ok(false);
                }
                let listeners = self
                    .subscript_listeners
                    .entry((id, sub.to_vec()))
                    .or_default();
                if !listeners.contains(&rank) {
                    listeners.push(rank);
                }
                Ok(true)
            }
            None => {
                if d.write_refcount == 0 {
                    Ok(false)
                } else {
                    if !d.listeners.contains(&rank) {
                        d.listeners.push(rank);
                    }
                    Ok(true)
                }
            }
        }
    }

    /// Reserves `container[sub]` with the unfilled sentinel. Returns
    /// `(created, value_present)`.
    pub fn insert_atomic(&mut self, id: i64, sub: &[u8]) -> Result<(bool, bool), DataError> {
        let d = self.tds.get_mut(&id).ok_or(DataError::NotFound)?;
        match &mut d.storage {
            Some(Value::Container { entries, .. }) => match entries.get(sub) {
                Some(existing) => Ok((false, existing.is_some())),
                None => {
                    entries.insert(sub.to_vec(), None);
                    Ok((true, false))
                }
            },
            _ => Err(DataError::Type),
        }
    }

    /// Stores a value into a datum, a container subscript, or appends to a
    /// multiset, then applies the refcount decrement atomically with the
    /// write. All resulting notifications land in `notifs`.
    pub fn store(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
        dtype: DataType,
        bytes: &[u8],
        refcount_decr: RefCounts,
        notifs: &mut NotifSet,
    ) -> Result<(), DataError> {
        // phase 1: mutate the datum; remember whether a container insert
        // happened so its notifications can be resolved afterwards
        enum StorePath {
            Append,
            SetScalar,
            Insert,
        }

        let mut inserted: Option<Value> = None;
        {
            let d = self.tds.get_mut(&id).ok_or(DataError::NotFound)?;

            // writing a closed datum is a double write
            if d.write_refcount <= 0 {
                pf_debug!("attempt to write closed var: <{}>", id);
                return Err(DataError::DoubleWrite);
            }

            let path = match (&d.storage, sub) {
                (Some(Value::Multiset { .. }), None) => StorePath::Append,
                (_, None) => StorePath::SetScalar,
                (Some(Value::Container { .. }), Some(_)) => StorePath::Insert,
                (_, Some(_)) => return Err(DataError::Type),
            };

            match path {
                StorePath::Append => {
                    let Some(Value::Multiset { elem_type, elems }) = &mut d.storage else {
                        unreachable!()
                    };
                    if dtype != *elem_type {
                        return Err(DataError::Type);
                    }
                    elems.push(Value::unpack(dtype, bytes)?);
                }
                StorePath::SetScalar => {
                    if dtype != d.dtype {
                        return Err(DataError::Type);
                    }
                    if d.storage.is_some() {
                        pf_debug!("already set: <{}>", id);
                        return Err(DataError::DoubleWrite);
                    }
                    d.storage = Some(Value::unpack(dtype, bytes)?);
                }
                StorePath::Insert => {
                    let sub = sub.unwrap();
                    let Some(Value::Container { val_type, entries, .. }) = &mut d.storage
                    else {
                        unreachable!()
                    };
                    if dtype != *val_type {
                        return Err(DataError::Type);
                    }
                    let v = Value::unpack(dtype, bytes)?;
                    match entries.entry(sub.to_vec()) {
                        std::collections::btree_map::Entry::Occupied(mut e) => {
                            if e.get().is_some() {
                                pf_debug!("already exists: <{}>[{:?}]", id, sub);
                                return Err(DataError::DoubleWrite);
                            }
                            // filling a reservation made by insert_atomic
                            *e.get_mut() = Some(v.clone());
                        }
                        std::collections::btree_map::Entry::Vacant(e) => {
                            e.insert(Some(v.clone()));
                        }
                    }
                    inserted = Some(v);
                }
            }
        }

        // phase 2: resolve subscript listeners and reference promises
        let mut freed_datum = false;
        if let (Some(v), Some(sub)) = (&inserted, sub) {
            self.insert_notifications(id, sub, v, notifs, &mut freed_datum)?;
        }

        // apply the refcount decrement atomically with the insertion
        debug_assert!(refcount_decr.read >= 0 && refcount_decr.write >= 0);
        if !refcount_decr.is_none() {
            if freed_datum {
                // the insert's own read decrement already destroyed it
                return Err(DataError::RefcountNegative);
            }
            self.refcount_impl(id, refcount_decr.negate(), RefCounts::NONE, notifs)?;
        }

        Ok(())
    }

    /// Resolves container-reference promises and insertion listeners after
    /// `container[sub]` was filled with `value`.
    fn insert_notifications(
        &mut self,
        container_id: i64,
        sub: &[u8],
        value: &Value,
        notifs: &mut NotifSet,
        freed_datum: &mut bool,
    ) -> Result<(), DataError> {
        let key = (container_id, sub.to_vec());

        if let Some(refs) = self.container_references.remove(&key) {
            // the referands of the inserted value gain one read count per
            // reference about to be written
            let nrefs = refs.len() as i32;
            value.each_ref_id(&mut |ref_id| {
                notifs.rc_dispatch.push((
                    ref_id,
                    RefCounts {
                        read: nrefs,
                        write: 0,
                    },
                ));
            });
            notifs.references.extend_from_slice(&refs);

            // the bucket held one read refcount on the container; release it
            let mut tmp = NotifSet::new();
            let outcome = self.refcount_impl(
                container_id,
                RefCounts { read: -1, write: 0 },
                RefCounts::NONE,
                &mut tmp,
            )?;
            debug_assert!(tmp.close_notify.is_empty());
            notifs.rc_dispatch.extend(tmp.rc_dispatch);
            *freed_datum = outcome.garbage_collected;
        }

        if let Some(ranks) = self.subscript_listeners.remove(&key) {
            notifs.insert_notify.extend(ranks);
        }
        Ok(())
    }

    /// Binds a promise: when `container[sub]` is filled, write the value to
    /// `ref_id`. If the subscript is already filled, returns the packed
    /// value immediately and the caller performs the reference write and
    /// releases the consumed read refcount itself.
    pub fn container_reference(
        &mut self,
        container_id: i64,
        sub: &[u8],
        ref_id: i64,
        ref_type: DataType,
    ) -> Result<Option<(DataType, Vec<u8>)>, DataError> {
        let d = self.tds.get_mut(&container_id).ok_or(DataError::NotFound)?;
        let (val_type, existing) = match &d.storage {
            Some(Value::Container {
                val_type, entries, ..
            }) => (*val_type, entries.get(sub)),
            _ => return Err(DataError::Type),
        };
        if ref_type != val_type {
            pf_debug!(
                "reference type mismatch on <{}>: expected {} actual {}",
                container_id,
                val_type.to_string_name(),
                ref_type.to_string_name()
            );
            return Err(DataError::Type);
        }

        if let Some(Some(v)) = existing {
            return Ok(Some((val_type, v.pack())));
        }

        // not filled yet: the container must still be open, and a read
        // refcount must be available for the bucket to hold
        if d.write_refcount <= 0 {
            pf_debug!(
                "reference on unfilled subscript of closed container <{}>",
                container_id
            );
            return Err(DataError::Invalid);
        }
        if d.read_refcount <= 0 {
            return Err(DataError::Invalid);
        }

        match self.container_references.entry((container_id, sub.to_vec())) {
            Entry::Occupied(mut e) => {
                // the bucket already holds its read refcount; release ours.
                // One count must remain for the bucket itself.
                if d.read_refcount < 2 {
                    pf_debug!(
                        "<{}> read_refcount: {} cannot cover another reference",
                        container_id,
                        d.read_refcount
                    );
                    return Err(DataError::RefcountNegative);
                }
                d.read_refcount -= 1;
                if !e.get().contains(&ref_id) {
                    e.get_mut().push(ref_id);
                }
            }
            Entry::Vacant(e) => {
                // first reference: the bucket keeps the caller's refcount
                e.insert(vec![ref_id]);
            }
        }
        Ok(None)
    }

    /// Reads a datum, container subscript, or struct field, then applies
    /// the retrieval refcount plan.
    pub fn retrieve(
        &mut self,
        id: i64,
        sub: Option<&[u8]>,
        refcounts: RetrieveRc,
        notifs: &mut NotifSet,
    ) -> Result<(DataType, Vec<u8>), DataError> {
        let d = self.tds.get(&id).ok_or(DataError::NotFound)?;

        let (dtype, value) = match sub {
            None => {
                let v = d.storage.as_ref().ok_or(DataError::Unset)?;
                (d.dtype, v.clone())
            }
            Some(sub) => match &d.storage {
                Some(Value::Container {
                    val_type, entries, ..
                }) => match entries.get(sub) {
                    None => {
                        pf_trace!("subscript not found");
                        return Err(DataError::SubscriptNotFound);
                    }
                    Some(None) => {
                        pf_trace!("subscript reserved but not linked");
                        return Err(DataError::SubscriptNotFound);
                    }
                    Some(Some(v)) => (*val_type, v.clone()),
                },
                Some(Value::Struct { fields, .. }) => {
                    let ix: usize = std::str::from_utf8(sub)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or(DataError::NumberFormat)?;
                    let v = fields.get(ix).ok_or(DataError::Invalid)?;
                    (v.dtype(), v.clone())
                }
                _ => return Err(DataError::Invalid),
            },
        };

        let bytes = value.pack();

        // apply the retrieval refcount plan: referand increments first, so
        // the caller can safely retain references into the payload
        let incr = refcounts.incr_referand;
        if !incr.is_none() {
            value.each_ref_id(&mut |ref_id| {
                notifs.rc_dispatch.push((ref_id, incr));
            });
        }
        let decr = refcounts.decr_self;
        if !decr.is_none() {
            self.refcount_impl(id, decr.negate(), RefCounts::NONE, notifs)?;
        }

        Ok((dtype, bytes))
    }

    /// Packs the `[offset, offset+count)` slice of a container or multiset.
    /// `count == -1` means to the end. Reserved (unfilled) container keys
    /// are not enumerated.
    pub fn enumerate(
        &mut self,
        id: i64,
        count: i64,
        offset: i64,
        include_keys: bool,
        include_vals: bool,
        decr: RefCounts,
        notifs: &mut NotifSet,
    ) -> Result<EnumerateResult, DataError> {
        let d = self.tds.get(&id).ok_or(DataError::NotFound)?;
        if offset < 0 {
            return Err(DataError::Invalid);
        }

        let mut data = Vec::new();
        let result = match &d.storage {
            Some(Value::Container {
                key_type,
                val_type,
                entries,
            }) => {
                let filled = entries.iter().filter_map(|(k, v)| {
                    v.as_ref().map(|v| (k, v))
                });
                let slice = enumerate_slice(filled, offset, count);
                let mut records = 0i64;
                for (k, v) in slice {
                    if include_keys {
                        vint::encode_to(k.len() as i64, &mut data);
                        data.extend_from_slice(k);
                    }
                    if include_vals {
                        v.pack_buffer(true, &mut data);
                    }
                    records += 1;
                }
                EnumerateResult {
                    records,
                    key_type: *key_type,
                    val_type: *val_type,
                    data,
                }
            }
            Some(Value::Multiset { elem_type, elems }) => {
                if include_keys {
                    return Err(DataError::Type);
                }
                let slice = enumerate_slice(elems.iter(), offset, count);
                let mut records = 0i64;
                for v in slice {
                    if include_vals {
                        v.pack_buffer(true, &mut data);
                    }
                    records += 1;
                }
                EnumerateResult {
                    records,
                    key_type: DataType::Null,
                    val_type: *elem_type,
                    data,
                }
            }
            _ => return Err(DataError::Type),
        };

        if !decr.is_none() {
            self.refcount_impl(id, decr.negate(), RefCounts::NONE, notifs)?;
        }
        Ok(result)
    }

    /// Number of members of a container or multiset.
    pub fn container_size(
        &mut self,
        id: i64,
        decr: RefCounts,
        notifs: &mut NotifSet,
    ) -> Result<i64, DataError> {
        let d = self.tds.get(&id).ok_or(DataError::NotFound)?;
        let size = match &d.storage {
            Some(Value::Container { entries, .. }) => entries.len() as i64,
            Some(Value::Multiset { elems, .. }) => elems.len() as i64,
            _ => return Err(DataError::Type),
        };
        if !decr.is_none() {
            self.refcount_impl(id, decr.negate(), RefCounts::NONE, notifs)?;
        }
        Ok(size)
    }

    /// The only way refcounts change after creation. `change` carries
    /// signed deltas; `scavenge` requests taking over referand read/write
    /// counts instead of the decrement round-trip, which only commits when
    /// the datum is actually destroyed by this change.
    pub fn refcount_incr(
        &mut self,
        id: i64,
        change: RefCounts,
        scavenge: RefCounts,
        notifs: &mut NotifSet,
    ) -> Result<RcOutcome, DataError> {
        if !self.tds.contains_key(&id) {
            return Err(DataError::NotFound);
        }
        self.refcount_impl(id, change, scavenge, notifs)
    }

    fn refcount_impl(
        &mut self,
        id: i64,
        change: RefCounts,
        scavenge: RefCounts,
        notifs: &mut NotifSet,
    ) -> Result<RcOutcome, DataError> {
        debug_assert!(scavenge.read >= 0 && scavenge.write >= 0);
        let d = self.tds.get_mut(&id).ok_or(DataError::NotFound)?;

        let mut outcome = RcOutcome::default();

        let will_gc = d.read_refcount + change.read <= 0 && d.write_refcount + change.write <= 0;

        if !scavenge.is_none() {
            // Don't go through with the decrement if the caller wants to
            // scavenge refcounts and the datum would survive: the referand
            // could otherwise be freed before the scavenger increments it.
            if !will_gc {
                return Ok(outcome);
            }
            // at most one refcount on each referand is scavenged
            if scavenge.read > 0 {
                outcome.scavenged.read = 1;
            }
            if scavenge.write > 0 {
                outcome.scavenged.write = 1;
            }
        }

        if change.read != 0 && !d.permanent {
            // permanent datums ignore read refcount changes entirely
            if d.read_refcount <= 0 || d.read_refcount + change.read < 0 {
                pf_debug!(
                    "<{}> read_refcount: {} incr: {}",
                    id,
                    d.read_refcount,
                    change.read
                );
                return Err(DataError::RefcountNegative);
            }
            d.read_refcount += change.read;
            pf_trace!("read_refcount: <{}> => {}", id, d.read_refcount);
        }

        if change.write != 0 {
            if d.write_refcount <= 0 || d.write_refcount + change.write < 0 {
                pf_debug!(
                    "<{}> write_refcount: {} incr: {}",
                    id,
                    d.write_refcount,
                    change.write
                );
                return Err(DataError::RefcountNegative);
            }
            d.write_refcount += change.write;
            pf_trace!("write_refcount: <{}> => {}", id, d.write_refcount);
            if d.write_refcount == 0 {
                // closed: every closure listener fires exactly once
                pf_debug!("close: <{}> listeners: {}", id, d.listeners.len());
                notifs.close_notify.append(&mut d.listeners);
            }
        }

        if d.read_refcount <= 0 && d.write_refcount <= 0 {
            outcome.garbage_collected = true;
            self.datum_gc(id, outcome.scavenged, notifs)?;
        }

        Ok(outcome)
    }

    /// Destroys a datum: frees its storage and arranges a read decrement
    /// for every embedded referand (skipped when the caller scavenged the
    /// corresponding count).
    fn datum_gc(
        &mut self,
        id: i64,
        scavenged: RefCounts,
        notifs: &mut NotifSet,
    ) -> Result<(), DataError> {
        pf_debug!("datum_gc: <{}>", id);
        let d = self.tds.remove(&id).ok_or(DataError::NotFound)?;
        if d.permanent {
            return Err(DataError::Unknown);
        }
        if !d.listeners.is_empty() {
            // closure drain must have emptied this before destruction
            return Err(DataError::Type);
        }
        if let Some(storage) = &d.storage {
            if scavenged.read == 0 {
                storage.each_ref_id(&mut |ref_id| {
                    notifs
                        .rc_dispatch
                        .push((ref_id, RefCounts { read: -1, write: 0 }));
                });
            }
        }
        self.locked.remove(&id);
        Ok(())
    }

    /// Advisory lock attempt; reports whether acquired.
    pub fn lock(&mut self, id: i64, rank: Rank) -> Result<bool, DataError> {
        if !self.tds.contains_key(&id) {
            return Err(DataError::NotFound);
        }
        match self.locked.entry(id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(e) => {
                e.insert(rank);
                Ok(true)
            }
        }
    }

    pub fn unlock(&mut self, id: i64) -> Result<(), DataError> {
        self.locked.remove(&id).ok_or(DataError::NotFound)?;
        Ok(())
    }

    /// Reports leaked datums and unfilled container references. Called at
    /// finalize; verbose output is gated on `ADLB_REPORT_LEAKS`.
    pub fn report_leaks(&self) {
        let verbose = env_boolean("ADLB_REPORT_LEAKS", false);
        for (&id, d) in &self.tds {
            if d.permanent {
                continue;
            }
            if d.storage.is_some() {
                pf_debug!("LEAK: <{}>", id);
                if verbose {
                    pf_info!(
                        "LEAK DETECTED: <{}> t:{} r:{} w:{}",
                        id,
                        d.dtype.to_string_name(),
                        d.read_refcount,
                        d.write_refcount
                    );
                }
            } else {
                pf_debug!("UNSET VARIABLE: <{}>", id);
                if verbose {
                    pf_info!("UNSET VARIABLE DETECTED: <{}>", id);
                }
            }
        }
        for ((id, sub), refs) in &self.container_references {
            for ref_id in refs {
                pf_warn!(
                    "UNFILLED CONTAINER REFERENCE <{}>[{:?}] => <{}>",
                    id,
                    sub,
                    ref_id
                );
            }
        }
    }
}

/// Lazily slices an iterator per enumerate rules: skip `offset`, then take
/// `count` (unlimited when negative).
fn enumerate_slice<I: Iterator>(iter: I, offset: i64, count: i64) -> impl Iterator<Item = I::Item> {
    let take = if count < 0 { usize::MAX } else { count as usize };
    iter.skip(offset as usize).take(take)
}
