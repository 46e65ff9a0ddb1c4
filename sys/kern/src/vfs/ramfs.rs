// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory filesystem.
//!
//! The development root: a flat map from normalized paths to entries,
//! enough to boot the init applet, exercise the VFS surface, and host
//! the self-tests. Real deployments mount a flash filesystem driver in
//! its place.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use abi::{
    NodeType, OpenFlags, PollEvents, VfsDirent, VfsError, VfsStat,
};

use super::object::{self, File, Node};
use super::{path, FilesystemOps};
use crate::port::Spinlock;
use crate::time::now_us;

enum RamEntry {
    Dir,
    File { data: Vec<u8>, mtime: u64 },
}

pub struct RamFs {
    self_ref: Weak<RamFs>,
    tree: Spinlock<HashMap<String, RamEntry>>,
}

impl RamFs {
    pub fn new() -> Arc<RamFs> {
        Arc::new_cyclic(|w| {
            let mut tree = HashMap::new();
            tree.insert("/".to_string(), RamEntry::Dir);
            RamFs {
                self_ref: w.clone(),
                tree: Spinlock::new(tree),
            }
        })
    }

    /// Populates a file wholesale, creating parent directories. Used by
    /// boot images and tests.
    pub fn add_file(
        &self,
        file_path: &str,
        contents: &[u8],
    ) -> Result<(), VfsError> {
        let abs =
            path::normalize(file_path).ok_or(VfsError::InvalidPath)?;
        let mut tree = self.tree.lock();
        let mut dir = path::parent(&abs).to_string();
        let mut missing = Vec::new();
        while !tree.contains_key(&dir) {
            missing.push(dir.clone());
            dir = path::parent(&dir).to_string();
        }
        for d in missing.into_iter().rev() {
            tree.insert(d, RamEntry::Dir);
        }
        tree.insert(
            abs,
            RamEntry::File {
                data: contents.to_vec(),
                mtime: now_us(),
            },
        );
        Ok(())
    }

    fn fs_arc(&self) -> Result<Arc<dyn FilesystemOps>, VfsError> {
        match self.self_ref.upgrade() {
            Some(fs) => Ok(fs),
            None => Err(VfsError::Io),
        }
    }

    fn make_node(
        &self,
        node_path: &str,
        node_type: NodeType,
    ) -> Result<Arc<Node>, VfsError> {
        let node = object::node_create(self.fs_arc()?, node_type);
        *node.fs_private.lock() = Some(Box::new(node_path.to_string()));
        Ok(node)
    }

    fn node_path(node: &Node) -> Result<String, VfsError> {
        let private = node.fs_private.lock();
        private
            .as_ref()
            .and_then(|b| b.downcast_ref::<String>())
            .cloned()
            .ok_or(VfsError::Io)
    }
}

impl FilesystemOps for RamFs {
    fn lookup(&self, lookup_path: &str) -> Result<Arc<Node>, VfsError> {
        let tree = self.tree.lock();
        match tree.get(lookup_path) {
            Some(RamEntry::Dir) => {
                drop(tree);
                self.make_node(lookup_path, NodeType::Directory)
            }
            Some(RamEntry::File { .. }) => {
                drop(tree);
                self.make_node(lookup_path, NodeType::File)
            }
            None => Err(VfsError::NotFound),
        }
    }

    fn open(
        &self,
        open_path: &str,
        flags: OpenFlags,
    ) -> Result<Arc<Node>, VfsError> {
        {
            let mut tree = self.tree.lock();
            match tree.get_mut(open_path) {
                Some(RamEntry::Dir) => {
                    if !flags.is_read_only() {
                        return Err(VfsError::InvalidParam);
                    }
                }
                Some(RamEntry::File { data, mtime }) => {
                    if flags
                        .contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL)
                    {
                        return Err(VfsError::Busy);
                    }
                    if flags.contains(OpenFlags::O_TRUNC)
                        && !flags.is_read_only()
                    {
                        data.clear();
                        *mtime = now_us();
                    }
                }
                None => {
                    if !flags.contains(OpenFlags::O_CREAT) {
                        return Err(VfsError::NotFound);
                    }
                    let parent = path::parent(open_path);
                    match tree.get(parent) {
                        Some(RamEntry::Dir) => {}
                        _ => return Err(VfsError::NotFound),
                    }
                    tree.insert(
                        open_path.to_string(),
                        RamEntry::File {
                            data: Vec::new(),
                            mtime: now_us(),
                        },
                    );
                }
            }
        }

        let node_type = match self.tree.lock().get(open_path) {
            Some(RamEntry::Dir) => NodeType::Directory,
            _ => NodeType::File,
        };
        self.make_node(open_path, node_type)
    }

    fn getattr(&self, node: &Node) -> Result<VfsStat, VfsError> {
        let node_path = Self::node_path(node)?;
        let tree = self.tree.lock();
        match tree.get(&node_path) {
            Some(RamEntry::Dir) => Ok(VfsStat {
                node_type: NodeType::Directory,
                size: 0,
                mtime: 0,
                mode: 0o755,
            }),
            Some(RamEntry::File { data, mtime }) => Ok(VfsStat {
                node_type: NodeType::File,
                size: data.len() as u64,
                mtime: *mtime,
                mode: 0o644,
            }),
            None => Err(VfsError::NotFound),
        }
    }

    fn read(
        &self,
        file: &File,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, VfsError> {
        let node_path = Self::node_path(file.node())?;
        let tree = self.tree.lock();
        let Some(RamEntry::File { data, .. }) = tree.get(&node_path)
        else {
            return Err(VfsError::NotSupported);
        };
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(
        &self,
        file: &File,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize, VfsError> {
        let node_path = Self::node_path(file.node())?;
        let mut tree = self.tree.lock();
        let Some(RamEntry::File { data, mtime }) =
            tree.get_mut(&node_path)
        else {
            return Err(VfsError::NotSupported);
        };
        let offset = offset as usize;
        if offset > data.len() {
            data.resize(offset, 0);
        }
        let overlap = buf.len().min(data.len().saturating_sub(offset));
        data[offset..offset + overlap].copy_from_slice(&buf[..overlap]);
        data.extend_from_slice(&buf[overlap..]);
        *mtime = now_us();
        Ok(buf.len())
    }

    fn readdir(
        &self,
        file: &File,
        index: usize,
        out: &mut [VfsDirent],
    ) -> Result<usize, VfsError> {
        let dir_path = Self::node_path(file.node())?;
        let tree = self.tree.lock();
        if !matches!(tree.get(&dir_path), Some(RamEntry::Dir)) {
            return Err(VfsError::NotSupported);
        }

        let mut children: Vec<(&String, &RamEntry)> = tree
            .iter()
            .filter(|(p, _)| {
                p.as_str() != "/" && path::parent(p) == dir_path
            })
            .collect();
        children.sort_by(|a, b| a.0.cmp(b.0));

        let mut produced = 0;
        for (child, entry) in children.into_iter().skip(index) {
            if produced >= out.len() {
                break;
            }
            let Some(name) = path::file_name(child) else {
                continue;
            };
            let mut dirent_name = arrayvec::ArrayString::new();
            if dirent_name.try_push_str(name).is_err() {
                continue;
            }
            out[produced] = VfsDirent {
                name: dirent_name,
                node_type: match entry {
                    RamEntry::Dir => NodeType::Directory,
                    RamEntry::File { .. } => NodeType::File,
                },
            };
            produced += 1;
        }
        Ok(produced)
    }

    fn unlink(&self, unlink_path: &str) -> Result<(), VfsError> {
        let mut tree = self.tree.lock();
        match tree.get(unlink_path) {
            None => Err(VfsError::NotFound),
            Some(RamEntry::Dir) => {
                if unlink_path == "/" {
                    return Err(VfsError::InvalidParam);
                }
                let busy = tree
                    .keys()
                    .any(|p| p != unlink_path && path::parent(p) == unlink_path);
                if busy {
                    return Err(VfsError::Busy);
                }
                tree.remove(unlink_path);
                Ok(())
            }
            Some(RamEntry::File { .. }) => {
                tree.remove(unlink_path);
                Ok(())
            }
        }
    }

    fn mkdir(&self, dir_path: &str, _mode: u32) -> Result<(), VfsError> {
        let mut tree = self.tree.lock();
        if tree.contains_key(dir_path) {
            return Err(VfsError::Busy);
        }
        match tree.get(path::parent(dir_path)) {
            Some(RamEntry::Dir) => {}
            _ => return Err(VfsError::NotFound),
        }
        tree.insert(dir_path.to_string(), RamEntry::Dir);
        Ok(())
    }

    fn poll(
        &self,
        _file: &File,
        events: PollEvents,
    ) -> Result<PollEvents, VfsError> {
        // Plain memory-backed entries never block.
        Ok(events & (PollEvents::POLLIN | PollEvents::POLLOUT))
    }
}
