use crate::arena::{align_up, Arena};
use crate::{ExecError, Fault, ListRef, Value};
use std::collections::HashMap;
use tracing::debug;

const NONE: u64 = u64::MAX;
const HEADER_SIZE: usize = 16;
const SIZE_MASK: u64 = (1 << 56) - 1;

const KIND_LIST: u64 = 1;
const KIND_ITEMS: u64 = 2;

const LIST_OBJECT_SIZE: usize = 24;
const SLOT_SIZE: usize = 16;
const MIN_CAPACITY: usize = 4;

const TAG_NOTHING: u64 = 0;
const TAG_BYTE: u64 = 1;
const TAG_INT: u64 = 2;
const TAG_FLOAT: u64 = 3;
const TAG_BOOL: u64 = 4;
const TAG_LIST: u64 = 5;
const TAG_FUNCTION: u64 = 6;
const TAG_LABEL: u64 = 7;

/// Which of the two arenas currently holds live objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Left,
    Right,
}

impl Space {
    fn flip(self) -> Space {
        match self {
            Space::Left => Space::Right,
            Space::Right => Space::Left,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub freed_bytes: usize,
    pub chunks_deleted: usize,
    pub live_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub used: usize,
    pub free: usize,
    pub collections: usize,
    pub epoch: u32,
    pub atoms: usize,
}

/// Bytes a chunk with `payload` bytes takes from an arena.
pub fn chunk_size(payload: usize) -> usize {
    HEADER_SIZE + align_up(payload)
}

pub fn list_object_bytes() -> usize {
    chunk_size(LIST_OBJECT_SIZE)
}

pub fn item_buffer_bytes(capacity: usize) -> usize {
    chunk_size(capacity * SLOT_SIZE)
}

/// Capacity of the buffer that replaces a full one.
pub fn grown_capacity(capacity: usize) -> usize {
    if capacity == 0 {
        MIN_CAPACITY
    } else {
        capacity * 2
    }
}

/// Semispace heap holding list objects and their item buffers.
///
/// Every chunk starts with a forwarding word and a `kind << 56 | size` word.
/// A list object is three words (items, size, capacity); an item buffer is a
/// run of 16 byte slots (tag, payload) whose unused tail is always zero.
pub struct Heap {
    left: Arena,
    right: Arena,
    active: Space,
    epoch: u32,
    guard_inactive: bool,
    atoms: Vec<Value>,
    collections: usize,
}

impl Heap {
    pub fn new(capacity: usize, guard_inactive: bool) -> Result<Self, ExecError> {
        let left = Arena::new(capacity)?;
        let mut right = Arena::new(capacity)?;
        if guard_inactive {
            right.lock()?;
        }
        Ok(Self {
            left,
            right,
            active: Space::Left,
            epoch: 0,
            guard_inactive,
            atoms: Vec::new(),
            collections: 0,
        })
    }

    pub fn active_space(&self) -> Space {
        self.active
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn free(&self) -> usize {
        self.arena().free()
    }

    pub fn stats(&self) -> HeapStats {
        let arena = self.arena();
        HeapStats {
            capacity: arena.capacity(),
            used: arena.used(),
            free: arena.free(),
            collections: self.collections,
            epoch: self.epoch,
            atoms: self.atoms.len(),
        }
    }

    fn arena(&self) -> &Arena {
        match self.active {
            Space::Left => &self.left,
            Space::Right => &self.right,
        }
    }

    fn arena_mut(&mut self) -> &mut Arena {
        match self.active {
            Space::Left => &mut self.left,
            Space::Right => &mut self.right,
        }
    }

    /// Returns `(from, to)` for a collection.
    fn spaces(&mut self) -> (&mut Arena, &mut Arena) {
        match self.active {
            Space::Left => (&mut self.left, &mut self.right),
            Space::Right => (&mut self.right, &mut self.left),
        }
    }

    pub fn check(&self, list: ListRef) -> Result<usize, Fault> {
        if list.epoch != self.epoch {
            return Err(Fault::StaleList {
                found: list.epoch,
                current: self.epoch,
            });
        }
        Ok(list.offset as usize)
    }

    fn alloc_chunk(&mut self, kind: u64, payload: usize) -> Option<usize> {
        let size = align_up(payload);
        let arena = self.arena_mut();
        let chunk = arena.bump(HEADER_SIZE + size)?;
        arena.write_u64(chunk, NONE);
        arena.write_u64(chunk + 8, kind << 56 | size as u64);
        Some(chunk + HEADER_SIZE)
    }

    /// Allocates an empty list without an item buffer.
    pub fn alloc_list(&mut self) -> Option<ListRef> {
        let object = self.alloc_chunk(KIND_LIST, LIST_OBJECT_SIZE)?;
        let arena = self.arena_mut();
        arena.write_u64(object, NONE);
        arena.write_u64(object + 8, 0);
        arena.write_u64(object + 16, 0);
        Some(ListRef {
            offset: object as u32,
            epoch: self.epoch,
        })
    }

    /// Allocates a zeroed item buffer and returns its payload offset.
    pub fn alloc_items(&mut self, capacity: usize) -> Option<usize> {
        let bytes = capacity * SLOT_SIZE;
        let items = self.alloc_chunk(KIND_ITEMS, bytes)?;
        self.arena_mut().zero(items, bytes);
        Some(items)
    }

    /// Moves the list's elements into `items` and makes it the list's buffer.
    pub fn install_items(
        &mut self,
        list: ListRef,
        items: usize,
        capacity: usize,
    ) -> Result<(), Fault> {
        let object = self.check(list)?;
        let arena = self.arena_mut();
        let old = arena.read_u64(object);
        let size = arena.read_u64(object + 8) as usize;
        if old != NONE && size > 0 {
            arena.copy_within(old as usize, items, size * SLOT_SIZE);
        }
        arena.write_u64(object, items as u64);
        arena.write_u64(object + 16, capacity as u64);
        Ok(())
    }

    fn header(&self, list: ListRef) -> Result<(usize, u64, usize, usize), Fault> {
        let object = self.check(list)?;
        let arena = self.arena();
        let items = arena.read_u64(object);
        let size = arena.read_u64(object + 8) as usize;
        let capacity = arena.read_u64(object + 16) as usize;
        Ok((object, items, size, capacity))
    }

    pub fn list_len(&self, list: ListRef) -> Result<usize, Fault> {
        Ok(self.header(list)?.2)
    }

    pub fn list_capacity(&self, list: ListRef) -> Result<usize, Fault> {
        Ok(self.header(list)?.3)
    }

    /// Element at `index`, or `None` past the end.
    pub fn list_get(&self, list: ListRef, index: usize) -> Result<Option<Value>, Fault> {
        let (_, items, size, _) = self.header(list)?;
        if index >= size {
            return Ok(None);
        }
        Ok(Some(self.read_slot(items as usize + index * SLOT_SIZE)))
    }

    pub fn list_values(&self, list: ListRef) -> Result<Vec<Value>, Fault> {
        let (_, items, size, _) = self.header(list)?;
        Ok((0..size)
            .map(|index| self.read_slot(items as usize + index * SLOT_SIZE))
            .collect())
    }

    /// Overwrites an element. Out of range indexes are ignored.
    pub fn list_set(&mut self, list: ListRef, index: usize, value: &Value) -> Result<bool, Fault> {
        let (_, items, size, _) = self.header(list)?;
        if index >= size {
            return Ok(false);
        }
        self.write_slot(items as usize + index * SLOT_SIZE, value)?;
        Ok(true)
    }

    /// Appends in place. Returns `false` when the buffer is full.
    pub fn try_push(&mut self, list: ListRef, value: &Value) -> Result<bool, Fault> {
        let (object, items, size, capacity) = self.header(list)?;
        if size >= capacity {
            return Ok(false);
        }
        self.write_slot(items as usize + size * SLOT_SIZE, value)?;
        self.arena_mut().write_u64(object + 8, size as u64 + 1);
        Ok(true)
    }

    /// Inserts in place at `index <= len`. Returns `false` when the buffer is
    /// full.
    pub fn try_insert(&mut self, list: ListRef, index: usize, value: &Value) -> Result<bool, Fault> {
        let (object, items, size, capacity) = self.header(list)?;
        debug_assert!(index <= size);
        if size >= capacity {
            return Ok(false);
        }
        let at = items as usize + index * SLOT_SIZE;
        self.arena_mut()
            .copy_within(at, at + SLOT_SIZE, (size - index) * SLOT_SIZE);
        self.write_slot(at, value)?;
        self.arena_mut().write_u64(object + 8, size as u64 + 1);
        Ok(true)
    }

    /// Removes an element, shifting the tail down. Out of range indexes are
    /// ignored.
    pub fn list_remove(&mut self, list: ListRef, index: usize) -> Result<bool, Fault> {
        let (object, items, size, _) = self.header(list)?;
        if index >= size {
            return Ok(false);
        }
        let at = items as usize + index * SLOT_SIZE;
        let arena = self.arena_mut();
        arena.copy_within(at + SLOT_SIZE, at, (size - index - 1) * SLOT_SIZE);
        arena.zero(items as usize + (size - 1) * SLOT_SIZE, SLOT_SIZE);
        arena.write_u64(object + 8, size as u64 - 1);
        Ok(true)
    }

    fn read_slot(&self, at: usize) -> Value {
        let arena = self.arena();
        let tag = arena.read_u64(at);
        let payload = arena.read_u64(at + 8);
        match tag {
            TAG_BYTE => Value::Byte(payload as u8),
            TAG_INT => Value::Int(payload as i64),
            TAG_FLOAT => Value::Float(f64::from_bits(payload)),
            TAG_BOOL => Value::Bool(payload != 0),
            TAG_LIST => Value::List(ListRef {
                offset: payload as u32,
                epoch: self.epoch,
            }),
            TAG_FUNCTION | TAG_LABEL => self
                .atoms
                .get(payload as usize)
                .cloned()
                .unwrap_or_default(),
            _ => Value::Nothing,
        }
    }

    fn write_slot(&mut self, at: usize, value: &Value) -> Result<(), Fault> {
        let (tag, payload) = match value {
            Value::Nothing => (TAG_NOTHING, 0),
            Value::Byte(v) => (TAG_BYTE, *v as u64),
            Value::Int(v) => (TAG_INT, *v as u64),
            Value::Float(v) => (TAG_FLOAT, v.to_bits()),
            Value::Bool(v) => (TAG_BOOL, *v as u64),
            Value::List(list) => (TAG_LIST, self.check(*list)? as u64),
            Value::Function(_) => (TAG_FUNCTION, self.intern(value)),
            Value::Label(_) => (TAG_LABEL, self.intern(value)),
        };
        let arena = self.arena_mut();
        arena.write_u64(at, tag);
        arena.write_u64(at + 8, payload);
        Ok(())
    }

    /// Index of `value` in the atom table, adding it only if no atom with the
    /// same bits exists.
    fn intern(&mut self, value: &Value) -> u64 {
        if let Some(index) = self.atoms.iter().position(|atom| atom.same_bits(value)) {
            return index as u64;
        }
        self.atoms.push(value.clone());
        (self.atoms.len() - 1) as u64
    }

    fn count_chunks(arena: &Arena) -> usize {
        let mut count = 0;
        let mut scan = 0;
        while scan < arena.used() {
            let size = (arena.read_u64(scan + 8) & SIZE_MASK) as usize;
            scan += HEADER_SIZE + size;
            count += 1;
        }
        count
    }

    /// Copies everything reachable from `roots` into the other arena and makes
    /// it active. Every list handle in `roots` is rewritten; all other
    /// handles become stale.
    pub fn collect<'a, I>(&mut self, roots: I) -> Result<CollectStats, ExecError>
    where
        I: IntoIterator<Item = &'a mut Value>,
    {
        let epoch = self.epoch.wrapping_add(1);
        let guard_inactive = self.guard_inactive;
        let mut atoms = Vec::new();
        let mut atom_map = HashMap::new();

        {
            let (_, to) = self.spaces();
            to.unlock()?;
            to.reset();
        }
        let old_atoms = std::mem::take(&mut self.atoms);
        let (from, to) = self.spaces();

        let used_before = from.used();
        let chunks_before = Self::count_chunks(from);

        for root in roots {
            if let Value::List(list) = root {
                let offset = evacuate(from, to, list.offset as usize);
                *list = ListRef {
                    offset: offset as u32,
                    epoch,
                };
            }
        }

        let mut scan = 0;
        while scan < to.used() {
            let header = to.read_u64(scan + 8);
            let kind = header >> 56;
            let size = (header & SIZE_MASK) as usize;
            let payload = scan + HEADER_SIZE;

            if kind == KIND_LIST {
                let items = to.read_u64(payload);
                if items != NONE {
                    let moved = evacuate(from, to, items as usize);
                    to.write_u64(payload, moved as u64);
                }
            } else if kind == KIND_ITEMS {
                for slot in (payload..payload + size).step_by(SLOT_SIZE) {
                    let tag = to.read_u64(slot);
                    let value = to.read_u64(slot + 8);
                    match tag {
                        TAG_LIST => {
                            let moved = evacuate(from, to, value as usize);
                            to.write_u64(slot + 8, moved as u64);
                        }
                        TAG_FUNCTION | TAG_LABEL => {
                            let index = *atom_map.entry(value).or_insert_with(|| {
                                atoms.push(old_atoms[value as usize].clone());
                                atoms.len() as u64 - 1
                            });
                            to.write_u64(slot + 8, index);
                        }
                        _ => {}
                    }
                }
            }
            scan += HEADER_SIZE + size;
        }

        let live_bytes = to.used();
        let chunks_after = Self::count_chunks(to);
        if guard_inactive {
            from.lock()?;
        }

        self.active = self.active.flip();
        self.epoch = epoch;
        self.atoms = atoms;
        self.collections += 1;

        let stats = CollectStats {
            freed_bytes: used_before - live_bytes,
            chunks_deleted: chunks_before - chunks_after,
            live_bytes,
        };
        debug!(
            "collected {} bytes, {} chunks deleted, {} bytes live",
            stats.freed_bytes, stats.chunks_deleted, stats.live_bytes
        );
        Ok(stats)
    }
}

/// Copies the chunk whose payload starts at `payload` into `to`, leaving a
/// forwarding offset behind. Returns the payload offset of the copy.
fn evacuate(from: &mut Arena, to: &mut Arena, payload: usize) -> usize {
    let chunk = payload - HEADER_SIZE;
    let forward = from.read_u64(chunk);
    if forward != NONE {
        return forward as usize;
    }
    let size = (from.read_u64(chunk + 8) & SIZE_MASK) as usize;
    let copy = to
        .bump(HEADER_SIZE + size)
        .expect("to-space is as large as from-space");
    to.copy_from(from, chunk, copy, HEADER_SIZE + size);
    to.write_u64(copy, NONE);
    from.write_u64(chunk, (copy + HEADER_SIZE) as u64);
    copy + HEADER_SIZE
}
