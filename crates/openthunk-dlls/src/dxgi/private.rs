//! Private data attached to a DXGI object by its users

use std::collections::HashMap;
use std::mem;

use openthunk_com::ForeignRef;
use openthunk_common::win::{Guid, HResult};

use super::{DXGI_ERROR_MORE_DATA, DXGI_ERROR_NOT_FOUND};

#[derive(Debug)]
enum Entry {
    Bytes(Vec<u8>),
    Interface(ForeignRef),
}

impl Entry {
    fn size(&self) -> u32 {
        match self {
            Entry::Bytes(bytes) => bytes.len() as u32,
            Entry::Interface(_) => mem::size_of::<usize>() as u32,
        }
    }
}

#[derive(Debug, Default)]
pub struct PrivateStore {
    entries: HashMap<Guid, Entry>,
}

impl PrivateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, guid: &Guid) -> HResult {
        match self.entries.remove(guid) {
            Some(_) => HResult::S_OK,
            None => HResult::S_FALSE,
        }
    }

    /// Store a copy of `data`, or remove the entry for `None`.
    pub fn set(&mut self, guid: Guid, data: Option<&[u8]>) -> HResult {
        match data {
            Some(data) => {
                self.entries.insert(guid, Entry::Bytes(data.to_vec()));
                HResult::S_OK
            }
            None => self.remove(&guid),
        }
    }

    /// Store a reference to `object`, or remove the entry for `None`.
    pub fn set_interface(&mut self, guid: Guid, object: Option<ForeignRef>) -> HResult {
        match object {
            Some(object) => {
                self.entries.insert(guid, Entry::Interface(object));
                HResult::S_OK
            }
            None => self.remove(&guid),
        }
    }

    /// Copy the entry into `out`. `size` is the buffer size on entry and the
    /// entry size on return. Without a buffer only the size is reported.
    /// Interfaces come out as a pointer carrying a new reference.
    pub fn get(&self, guid: &Guid, size: &mut u32, out: Option<&mut [u8]>) -> HResult {
        let Some(entry) = self.entries.get(guid) else {
            *size = 0;
            return DXGI_ERROR_NOT_FOUND;
        };
        let needed = entry.size();
        let Some(out) = out else {
            *size = needed;
            return HResult::S_OK;
        };
        if *size < needed || out.len() < needed as usize {
            *size = needed;
            return DXGI_ERROR_MORE_DATA;
        }
        match entry {
            Entry::Bytes(bytes) => out[..bytes.len()].copy_from_slice(bytes),
            Entry::Interface(object) => {
                let raw = object.to_raw_add_ref() as usize;
                out[..mem::size_of::<usize>()].copy_from_slice(&raw.to_ne_bytes());
            }
        }
        *size = needed;
        HResult::S_OK
    }
}
