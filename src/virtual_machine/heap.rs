//! VM-visible memory: raw blocks, managed objects and class descriptors.
//!
//! Every pointer the interpreter dereferences resolves to a byte offset in a
//! [`Block`]. Blocks carry plain bytes plus a side table of reference slots so
//! strings and pointers stored in memory keep their identity (and stay visible
//! to the collector) without exposing host addresses.
//!
//! Managed objects pair a class with a block sized by that class. They are the
//! only values the write barrier and the collector track.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::value::{
    Address, BlockId, ClassId, FunctionId, Handle, ObjectRef, Pointer,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Size in bytes of a pointer slot in memory.
pub const POINTER_SIZE: u32 = 8;
/// Size in bytes of a string slot in memory.
pub const STRING_SIZE: u32 = 8;

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with generational handles; stale handles never alias a reused slot.
struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, value: T) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return Handle {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    fn get(&self, handle: Handle) -> Option<&T> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.value.as_ref())
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.value.as_mut())
    }

    fn remove(&mut self, handle: Handle) -> Option<T> {
        let entry = self.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(value)
    }

    fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.value.as_ref().map(|_| Handle {
                index: i as u32,
                generation: e.generation,
            })
        })
    }
}

/// A reference stored in memory.
#[derive(Clone, Debug, PartialEq)]
enum Slot {
    Str(String),
    Ptr(Pointer),
}

/// A contiguous run of VM memory.
#[derive(Default)]
pub struct Block {
    bytes: Vec<u8>,
    refs: BTreeMap<u32, Slot>,
}

impl Block {
    fn new(size: u32) -> Self {
        Self {
            bytes: vec![0; size as usize],
            refs: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn check(&self, offset: u32, width: usize) -> Result<usize, VMError> {
        let start = offset as usize;
        if start + width > self.bytes.len() {
            return Err(VMError::AddressOutOfRange {
                offset: offset as i64,
                width,
                len: self.bytes.len(),
            });
        }
        Ok(start)
    }

    /// Drops reference slots overlapping `[offset, offset + width)`.
    fn clear_refs(&mut self, offset: u32, width: u32) {
        let low = offset.saturating_sub(POINTER_SIZE.max(STRING_SIZE) - 1);
        let high = offset + width;
        let doomed: Vec<u32> = self
            .refs
            .range(low..high)
            .filter(|(start, _)| **start + POINTER_SIZE > offset)
            .map(|(start, _)| *start)
            .collect();
        for start in doomed {
            self.refs.remove(&start);
        }
    }

    fn pointers(&self) -> impl Iterator<Item = Pointer> + '_ {
        self.refs.values().filter_map(|slot| match slot {
            Slot::Ptr(p) => Some(*p),
            Slot::Str(_) => None,
        })
    }
}

struct Object {
    class: ClassId,
    block: BlockId,
}

/// Descriptor for a script class.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassInfo {
    pub name: String,
    pub parent: Option<ClassId>,
    /// Instance size in bytes.
    pub size: u32,
    pub virtuals: Vec<FunctionId>,
}

/// All classes known to the VM, addressable by id or (case-insensitive) name.
#[derive(Default)]
pub struct ClassRegistry {
    classes: Vec<ClassInfo>,
    by_name: HashMap<String, ClassId>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a class, replacing an existing definition of the same name in place.
    pub fn define(
        &mut self,
        name: &str,
        parent: Option<ClassId>,
        size: u32,
        virtuals: Vec<FunctionId>,
    ) -> ClassId {
        let info = ClassInfo {
            name: name.to_string(),
            parent,
            size,
            virtuals,
        };
        let key = name.to_ascii_lowercase();
        if let Some(id) = self.by_name.get(&key) {
            self.classes[id.0 as usize] = info;
            return *id;
        }
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(info);
        self.by_name.insert(key, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn get(&self, id: ClassId) -> Option<&ClassInfo> {
        self.classes.get(id.0 as usize)
    }

    /// Replaces one entry of a class's virtual table, growing it as needed.
    pub fn set_virtual(&mut self, id: ClassId, slot: usize, func: FunctionId) -> Result<(), VMError> {
        let class = self
            .classes
            .get_mut(id.0 as usize)
            .ok_or(VMError::DanglingReference {
                what: "class",
                index: id.0,
            })?;
        if class.virtuals.len() <= slot {
            class.virtuals.resize(slot + 1, func);
        }
        class.virtuals[slot] = func;
        Ok(())
    }

    /// True if `class` is `ancestor` or inherits from it.
    pub fn is_descendant_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        // Parent chains are finite but a bad `define` could close a loop.
        let mut hops = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.classes.len() {
                return false;
            }
            current = self.get(id).and_then(|c| c.parent);
        }
        false
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Block and object storage shared by the VM and its host.
pub struct Heap {
    blocks: Arena<Block>,
    objects: Arena<Object>,
    pub classes: ClassRegistry,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            blocks: Arena::new(),
            objects: Arena::new(),
            classes: ClassRegistry::new(),
        }
    }

    /// Allocates a zeroed block of `size` bytes.
    pub fn alloc(&mut self, size: u32) -> BlockId {
        BlockId(self.blocks.insert(Block::new(size)))
    }

    /// Frees a raw block. Object blocks are released by the collector.
    pub fn free(&mut self, block: BlockId) -> Result<(), VMError> {
        self.blocks
            .remove(block.0)
            .map(|_| ())
            .ok_or(VMError::DanglingReference {
                what: "block",
                index: block.0.index,
            })
    }

    /// Allocates an instance of `class`, zero-initialized.
    pub fn new_object(&mut self, class: ClassId) -> Result<ObjectRef, VMError> {
        let size = self
            .classes
            .get(class)
            .ok_or(VMError::DanglingReference {
                what: "class",
                index: class.0,
            })?
            .size;
        let block = self.alloc(size);
        Ok(ObjectRef(self.objects.insert(Object { class, block })))
    }

    fn object(&self, obj: ObjectRef) -> Result<&Object, VMError> {
        self.objects.get(obj.0).ok_or(VMError::DanglingReference {
            what: "object",
            index: obj.0.index,
        })
    }

    pub fn object_class(&self, obj: ObjectRef) -> Result<ClassId, VMError> {
        Ok(self.object(obj)?.class)
    }

    /// Address of the first byte of an object's storage.
    pub fn object_address(&self, obj: ObjectRef) -> Result<Address, VMError> {
        Ok(Address {
            block: self.object(obj)?.block,
            offset: 0,
        })
    }

    /// True if `obj` is live and its class is `class` or derives from it.
    pub fn is_kind_of(&self, obj: ObjectRef, class: ClassId) -> bool {
        self.object(obj)
            .is_ok_and(|o| self.classes.is_descendant_of(o.class, class))
    }

    pub fn live_objects(&self) -> usize {
        self.objects.live
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.live
    }

    /// Resolves a pointer used as a memory base. `Null` resolves to `None`.
    pub fn resolve(&self, pointer: Pointer) -> Result<Option<Address>, VMError> {
        match pointer {
            Pointer::Null => Ok(None),
            Pointer::Addr(addr) => Ok(Some(addr)),
            Pointer::Object(obj) => self.object_address(obj).map(Some),
            Pointer::Class(_) | Pointer::Function(_) => Err(VMError::NotAddressable {
                pointer: pointer.to_string(),
            }),
        }
    }

    /// Moves `addr` by `delta` bytes. The result may point one past the end
    /// of the block but never before its start.
    pub fn displace(&self, addr: Address, delta: i64) -> Result<Address, VMError> {
        let len = self.block(addr.block)?.len();
        let target = addr.offset as i64 + delta;
        if target < 0 || target > len as i64 {
            return Err(VMError::AddressOutOfRange {
                offset: target,
                width: 0,
                len,
            });
        }
        Ok(Address {
            block: addr.block,
            offset: target as u32,
        })
    }

    pub fn block(&self, block: BlockId) -> Result<&Block, VMError> {
        self.blocks.get(block.0).ok_or(VMError::DanglingReference {
            what: "block",
            index: block.0.index,
        })
    }

    fn block_mut(&mut self, block: BlockId) -> Result<&mut Block, VMError> {
        self.blocks.get_mut(block.0).ok_or(VMError::DanglingReference {
            what: "block",
            index: block.0.index,
        })
    }

    /// Reads `N` little-endian bytes at `addr`.
    pub fn read_bytes<const N: usize>(&self, addr: Address) -> Result<[u8; N], VMError> {
        let block = self.block(addr.block)?;
        let start = block.check(addr.offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&block.bytes[start..start + N]);
        Ok(out)
    }

    /// Writes raw bytes at `addr`, dropping any reference stored over them.
    pub fn write_bytes(&mut self, addr: Address, data: &[u8]) -> Result<(), VMError> {
        let block = self.block_mut(addr.block)?;
        let start = block.check(addr.offset, data.len())?;
        block.clear_refs(addr.offset, data.len() as u32);
        block.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_string(&self, addr: Address) -> Result<String, VMError> {
        let block = self.block(addr.block)?;
        block.check(addr.offset, STRING_SIZE as usize)?;
        match block.refs.get(&addr.offset) {
            Some(Slot::Str(s)) => Ok(s.clone()),
            None => Ok(String::new()),
            Some(Slot::Ptr(_)) => Err(VMError::SlotMismatch {
                offset: addr.offset,
                expected: "string",
            }),
        }
    }

    pub fn write_string(&mut self, addr: Address, value: String) -> Result<(), VMError> {
        self.write_bytes(addr, &[0; STRING_SIZE as usize])?;
        self.block_mut(addr.block)?
            .refs
            .insert(addr.offset, Slot::Str(value));
        Ok(())
    }

    pub fn read_pointer(&self, addr: Address) -> Result<Pointer, VMError> {
        let block = self.block(addr.block)?;
        block.check(addr.offset, POINTER_SIZE as usize)?;
        match block.refs.get(&addr.offset) {
            Some(Slot::Ptr(p)) => Ok(*p),
            None => Ok(Pointer::Null),
            Some(Slot::Str(_)) => Err(VMError::SlotMismatch {
                offset: addr.offset,
                expected: "pointer",
            }),
        }
    }

    pub fn write_pointer(&mut self, addr: Address, value: Pointer) -> Result<(), VMError> {
        self.write_bytes(addr, &[0; POINTER_SIZE as usize])?;
        if !value.is_null() {
            self.block_mut(addr.block)?
                .refs
                .insert(addr.offset, Slot::Ptr(value));
        }
        Ok(())
    }

    /// Reads a NUL-terminated byte string starting at `addr`.
    ///
    /// Stops at the end of the block if no terminator is found. Invalid UTF-8
    /// is replaced rather than rejected.
    pub fn read_cstring(&self, addr: Address) -> Result<String, VMError> {
        let block = self.block(addr.block)?;
        let start = block.check(addr.offset, 0)?;
        let tail = &block.bytes[start..];
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Mark-and-sweep over managed objects. Returns how many were freed.
    ///
    /// Raw blocks reachable from the roots are scanned for pointers but are
    /// never freed here; their owners release them explicitly.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Pointer>) -> usize {
        let mut marked: HashSet<Handle> = HashSet::new();
        let mut scanned: HashSet<Handle> = HashSet::new();
        let mut pending: Vec<Pointer> = roots.into_iter().collect();

        while let Some(pointer) = pending.pop() {
            let block = match pointer {
                Pointer::Object(obj) => {
                    let Some(object) = self.objects.get(obj.0) else {
                        continue;
                    };
                    if !marked.insert(obj.0) {
                        continue;
                    }
                    object.block
                }
                Pointer::Addr(addr) => addr.block,
                _ => continue,
            };
            if !scanned.insert(block.0) {
                continue;
            }
            if let Some(block) = self.blocks.get(block.0) {
                pending.extend(block.pointers());
            }
        }

        let garbage: Vec<Handle> = self
            .objects
            .handles()
            .filter(|h| !marked.contains(h))
            .collect();
        for handle in &garbage {
            if let Some(object) = self.objects.remove(*handle) {
                self.blocks.remove(object.block.0);
            }
        }
        garbage.len()
    }
}
