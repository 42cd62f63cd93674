//! Object tree / cache: presents the three-tier Root / storage
//! directory / ordinary directory hierarchy over a [`Session`], caching
//! each directory's listing until a mutation invalidates it.
//!
//! Rather than a recursive, owned tree with back-pointers from child to
//! parent, nodes live in a flat arena keyed by `(storage_id, handle)`
//! and parent links are arena indices, not owned child vectors with
//! cyclic references back up to their parent.

use std::collections::HashMap;

use crate::session::Session;
use crate::storage::{
    AssociationCode, ObjectFormatCode, ObjectHandle, StandardAssociationCode,
    StandardObjectFormatCode, StorageId,
};
use crate::transport::Transport;
use crate::{Error, ObjectInfo};

/// A node's place in the three-tier hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Root,
    StorageDir,
    Dir,
    File,
}

/// Identifies a node independent of its arena slot: the root is the
/// only node without a storage, so it gets its own variant rather than
/// a sentinel `StorageId`/`ObjectHandle` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Root,
    StorageDir(StorageId),
    Object(StorageId, ObjectHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// Never listed, or invalidated since the last listing.
    Stale,
    /// `GetObjectHandles` + `GetObjectInfo` has populated `children`.
    Fresh,
}

struct Node {
    kind: Kind,
    key: NodeKey,
    parent: Option<NodeKey>,
    filename: String,
    is_dir: bool,
    cache_state: CacheState,
    children: Vec<NodeKey>,
    /// `object_compressed_size` for a file node; 0 for directories.
    size: u64,
    /// Raw PTP date strings (`YYYYMMDDThhmmss`) from `ObjectInfo`,
    /// carried through for the FUSE adapter's attribute mapping.
    capture_date: String,
    modification_date: String,
}

/// How [`Tree::create`] reconciles a device that returns handle `0`
/// from `SendObjectInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatePolicy {
    /// Reject with `Error::CacheInconsistent` when more than one
    /// unrecognized handle appears in the post-create listing.
    #[default]
    Strict,
    /// Pick the first unrecognized handle, matching the original
    /// source's unverified behavior.
    FirstUnseenHandle,
}

/// Arena-backed object tree/cache over one [`Session`].
pub struct Tree {
    nodes: HashMap<NodeKey, Node>,
    /// Bumped on every invalidation; lets a consumer detect a stale
    /// enumeration cursor cheaply.
    version: u64,
}

impl Tree {
    pub fn new() -> Tree {
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeKey::Root,
            Node {
                kind: Kind::Root,
                key: NodeKey::Root,
                parent: None,
                filename: String::new(),
                is_dir: true,
                cache_state: CacheState::Stale,
                children: Vec::new(),
                size: 0,
                capture_date: String::new(),
                modification_date: String::new(),
            },
        );
        Tree { nodes, version: 0 }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Lists `key`'s children, populating the cache from the device if
    /// it is currently `Stale`.
    pub fn list<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        key: NodeKey,
    ) -> Result<Vec<NodeKey>, Error> {
        if key == NodeKey::Root {
            self.ensure_root_listed(session)?;
        } else {
            let fresh = self
                .nodes
                .get(&key)
                .map(|n| n.cache_state == CacheState::Fresh)
                .unwrap_or(false);
            if !fresh {
                self.populate_directory(session, key)?;
            }
        }
        Ok(self.nodes.get(&key).map(|n| n.children.clone()).unwrap_or_default())
    }

    fn ensure_root_listed<T: Transport>(&mut self, session: &mut Session<T>) -> Result<(), Error> {
        let fresh = self
            .nodes
            .get(&NodeKey::Root)
            .map(|n| n.cache_state == CacheState::Fresh)
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }

        let ids = session.get_storage_ids()?;
        let mut children = Vec::new();
        for id in ids.into_iter().filter(|id| id.is_attached()) {
            let key = NodeKey::StorageDir(id);
            children.push(key);
            self.nodes.entry(key).or_insert_with(|| Node {
                kind: Kind::StorageDir,
                key,
                parent: Some(NodeKey::Root),
                filename: format!("storage-{:08x}", id.raw()),
                is_dir: true,
                cache_state: CacheState::Stale,
                children: Vec::new(),
                size: 0,
                capture_date: String::new(),
                modification_date: String::new(),
            });
        }

        let root = self.nodes.get_mut(&NodeKey::Root).unwrap();
        root.children = children;
        root.cache_state = CacheState::Fresh;
        Ok(())
    }

    /// `StorageDir(s)`: lists with `parent=0xffffffff`, then
    /// post-filters to `storage_id=s ∧ parent=0` since some devices
    /// return a storage-wide list rather than an actual root-only one
    ///. `Dir(h)`: lists with `parent=h`, no post-filter needed
    /// since the device already scopes by parent handle.
    fn populate_directory<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        key: NodeKey,
    ) -> Result<(), Error> {
        let (storage, device_parent, post_filter) = match key {
            NodeKey::StorageDir(s) => (s, ObjectHandle::root(), true),
            NodeKey::Object(s, h) => (s, h, false),
            NodeKey::Root => unreachable!("root is listed by ensure_root_listed"),
        };

        let handles = session.get_object_handles(storage, None, Some(device_parent))?;

        let mut children = Vec::new();
        for handle in handles {
            let info = session.get_object_info(handle)?;
            if post_filter {
                let parent_matches = info.parent_object == 0 || info.parent_object == 0xffffffff;
                if info.storage_id != storage.raw() || !parent_matches {
                    continue;
                }
            }

            let is_dir = matches!(
                (info.object_format, info.association_type),
                (
                    ObjectFormatCode::Standard(StandardObjectFormatCode::Association),
                    AssociationCode::Standard(StandardAssociationCode::GenericFolder)
                )
            );
            let child_key = NodeKey::Object(storage, handle);
            children.push(child_key);
            self.nodes.insert(
                child_key,
                Node {
                    kind: if is_dir { Kind::Dir } else { Kind::File },
                    key: child_key,
                    parent: Some(key),
                    filename: info.filename,
                    is_dir,
                    cache_state: CacheState::Stale,
                    children: Vec::new(),
                    size: info.object_compressed_size as u64,
                    capture_date: info.capture_date,
                    modification_date: info.modification_date,
                },
            );
        }

        let node = self.nodes.get_mut(&key).unwrap();
        node.children = children;
        node.cache_state = CacheState::Fresh;
        Ok(())
    }

    pub fn filename(&self, key: NodeKey) -> Option<&str> {
        self.nodes.get(&key).map(|n| n.filename.as_str())
    }

    pub fn is_dir(&self, key: NodeKey) -> Option<bool> {
        self.nodes.get(&key).map(|n| n.is_dir)
    }

    pub fn kind(&self, key: NodeKey) -> Option<Kind> {
        self.nodes.get(&key).map(|n| n.kind)
    }

    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(&key).and_then(|n| n.parent)
    }

    pub fn size(&self, key: NodeKey) -> Option<u64> {
        self.nodes.get(&key).map(|n| n.size)
    }

    /// `capture_date` if present, else `modification_date`, else `None`
    /// (matches the CLI's own fallback order, reused by the FUSE adapter
    /// for `mtime`).
    pub fn timestamp(&self, key: NodeKey) -> Option<&str> {
        self.nodes.get(&key).and_then(|n| {
            if !n.capture_date.is_empty() {
                Some(n.capture_date.as_str())
            } else if !n.modification_date.is_empty() {
                Some(n.modification_date.as_str())
            } else {
                None
            }
        })
    }

    /// The object handle backing `key`, if any (root and storage
    /// directories have none).
    pub fn object_handle(&self, key: NodeKey) -> Option<ObjectHandle> {
        match key {
            NodeKey::Object(_, h) => Some(h),
            _ => None,
        }
    }

    /// Looks up a child of `parent` by filename, listing it first if
    /// its cache is stale.
    pub fn lookup<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        parent: NodeKey,
        name: &str,
    ) -> Result<Option<NodeKey>, Error> {
        let children = self.list(session, parent)?;
        Ok(children
            .into_iter()
            .find(|k| self.filename(*k) == Some(name)))
    }

    /// Drops `key`'s cached listing and bumps the version counter
    /// (any other handle under the same storage may now be stale).
    pub fn invalidate(&mut self, key: NodeKey) {
        if let Some(node) = self.nodes.get_mut(&key) {
            node.cache_state = CacheState::Stale;
            let stale_children: Vec<NodeKey> = node.children.drain(..).collect();
            self.version += 1;
            for child in stale_children {
                self.nodes.remove(&child);
            }
        }
    }

    /// Creates an empty file named `name` under `parent` (a
    /// `StorageDir` or `Dir`).
    pub fn create<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        parent: NodeKey,
        name: &str,
        policy: CreatePolicy,
    ) -> Result<NodeKey, Error> {
        self.create_with_data(session, parent, name, &[], policy)
    }

    /// Creates a file named `name` under `parent` with `data` as its
    /// body. `create` is the `data = &[]`
    /// special case (still required to flush an empty data phase).
    pub fn create_with_data<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        parent: NodeKey,
        name: &str,
        data: &[u8],
        policy: CreatePolicy,
    ) -> Result<NodeKey, Error> {
        self.create_object(
            session,
            parent,
            name,
            mime_format(name),
            AssociationCode::Standard(StandardAssociationCode::Undefined),
            data,
            policy,
        )
    }

    /// Creates a directory (an `Association`/`GenericFolder` object)
    /// named `name` under `parent`.
    pub fn mkdir<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        parent: NodeKey,
        name: &str,
        policy: CreatePolicy,
    ) -> Result<NodeKey, Error> {
        self.create_object(
            session,
            parent,
            name,
            ObjectFormatCode::Standard(StandardObjectFormatCode::Association),
            AssociationCode::Standard(StandardAssociationCode::GenericFolder),
            &[],
            policy,
        )
    }

    fn create_object<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        parent: NodeKey,
        name: &str,
        format: ObjectFormatCode,
        association_type: AssociationCode,
        data: &[u8],
        policy: CreatePolicy,
    ) -> Result<NodeKey, Error> {
        let (storage, device_parent) = self.device_scope(parent)?;

        // ensure the "before" set is cached so a handle-0 reconciliation
        // has something to diff against.
        let before: std::collections::HashSet<ObjectHandle> = self
            .list(session, parent)?
            .into_iter()
            .filter_map(|k| match k {
                NodeKey::Object(_, h) => Some(h),
                _ => None,
            })
            .collect();

        let info = ObjectInfo {
            storage_id: storage.raw(),
            object_format: format,
            protection_status: 0,
            object_compressed_size: data.len() as u32,
            thumb_format: ObjectFormatCode::Standard(StandardObjectFormatCode::UndefinedNonImage),
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: device_parent.raw(),
            association_type,
            association_desc: 0,
            sequence_number: 0,
            filename: name.to_owned(),
            capture_date: String::new(),
            modification_date: String::new(),
            keywords: String::new(),
        };

        let (_, _, mut handle) = session.send_object_info(storage, device_parent, &info)?;
        session.send_object(data)?;

        if handle.raw() == 0 {
            self.invalidate(parent);
            let after = self.list(session, parent)?;
            let mut unseen: Vec<ObjectHandle> = after
                .into_iter()
                .filter_map(|k| match k {
                    NodeKey::Object(_, h) if !before.contains(&h) => Some(h),
                    _ => None,
                })
                .collect();
            match (unseen.len(), policy) {
                (0, _) => return Err(Error::CacheInconsistent),
                (1, _) => handle = unseen.remove(0),
                (_, CreatePolicy::FirstUnseenHandle) => handle = unseen.remove(0),
                (_, CreatePolicy::Strict) => return Err(Error::CacheInconsistent),
            }
        } else {
            self.invalidate(parent);
            self.list(session, parent)?;
        }

        Ok(NodeKey::Object(storage, handle))
    }

    /// Issues `DeleteObject` and invalidates the parent's cache. Does
    /// not pre-check whether a directory is empty: device behavior here
    /// varies, so `rmdir`/`unlink` both land here and let the device
    /// reject it if it must.
    pub fn delete<T: Transport>(&mut self, session: &mut Session<T>, key: NodeKey) -> Result<(), Error> {
        let handle = match key {
            NodeKey::Object(_, h) => h,
            _ => return Err(Error::NotSupported),
        };
        let parent = self.parent(key);
        session.delete_object(handle)?;
        self.nodes.remove(&key);
        if let Some(parent) = parent {
            self.invalidate(parent);
        }
        Ok(())
    }

    /// Write-back for a modified file: deletes the old object,
    /// then recreates it with `data` as the new body. The returned
    /// `NodeKey` carries a new handle; the old one is no longer valid
    /// and any caller-held reference to it must be re-resolved by name.
    pub fn write_back<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        key: NodeKey,
        data: &[u8],
        policy: CreatePolicy,
    ) -> Result<NodeKey, Error> {
        let parent = self.parent(key).ok_or(Error::NotSupported)?;
        let filename = self.filename(key).ok_or(Error::NotSupported)?.to_owned();
        let handle = self.object_handle(key).ok_or(Error::NotSupported)?;

        session.delete_object(handle)?;
        self.nodes.remove(&key);
        self.invalidate(parent);

        self.create_with_data(session, parent, &filename, data, policy)
    }

    fn device_scope(&self, key: NodeKey) -> Result<(StorageId, ObjectHandle), Error> {
        match key {
            NodeKey::StorageDir(s) => Ok((s, ObjectHandle::root())),
            NodeKey::Object(s, h) => Ok((s, h)),
            NodeKey::Root => Err(Error::NotSupported),
        }
    }
}

/// Maps a lowercase filename suffix to an object format. Unknown
/// or missing suffixes fall back to `Undefined`, since write-time
/// format detection here is suffix-based only.
pub fn mime_format(filename: &str) -> ObjectFormatCode {
    use StandardObjectFormatCode::*;

    let suffix = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    let code = match suffix.as_str() {
        "txt" => Text,
        "mp3" => Mp3,
        "mpg" => Mpeg,
        "wav" => Wav,
        "avi" => Avi,
        "asf" => Asf,
        "jpg" | "jpeg" => ExifJpeg,
        "tif" | "tiff" => Tiff,
        "bmp" => Bmp,
        "gif" => Gif,
        "pcd" => Pcd,
        "pct" => Pict,
        "png" => Png,
        _ => UndefinedNonImage,
    };
    ObjectFormatCode::Standard(code)
}

/// Maps an object format back to a download extension (CLI naming,
/// detection has no metadata to rely on). `Association` has no extension; unrecognized formats fall back
/// to `.bin`.
pub fn format_extension(format: ObjectFormatCode) -> &'static str {
    use StandardObjectFormatCode::*;

    match format {
        ObjectFormatCode::Standard(Association) => "",
        ObjectFormatCode::Standard(Script) => ".bat",
        ObjectFormatCode::Standard(Executable) => ".exe",
        ObjectFormatCode::Standard(Html) => ".htm",
        ObjectFormatCode::Standard(Dpof) => ".dpof",
        ObjectFormatCode::Standard(Aiff) => ".aiff",
        ObjectFormatCode::Standard(Text) => ".txt",
        ObjectFormatCode::Standard(Mp3) => ".mp3",
        ObjectFormatCode::Standard(Mpeg) => ".mpg",
        ObjectFormatCode::Standard(Wav) => ".wav",
        ObjectFormatCode::Standard(Avi) => ".avi",
        ObjectFormatCode::Standard(Asf) => ".asf",
        ObjectFormatCode::Standard(ExifJpeg) => ".jpg",
        ObjectFormatCode::Standard(Jp2) | ObjectFormatCode::Standard(Jpx) => ".jpg",
        ObjectFormatCode::Standard(Tiff) | ObjectFormatCode::Standard(TiffEp) => ".tif",
        ObjectFormatCode::Standard(Bmp) => ".bmp",
        ObjectFormatCode::Standard(Gif) => ".gif",
        ObjectFormatCode::Standard(Pcd) => ".pcd",
        ObjectFormatCode::Standard(Pict) => ".pct",
        ObjectFormatCode::Standard(Png) => ".png",
        _ => ".bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container;
    use crate::session::SessionBuilder;
    use crate::transport::fake::FakeTransport;
    use byteorder::{LittleEndian, WriteBytesExt};
    use num_traits::ToPrimitive;

    fn device_info_bytes() -> Vec<u8> {
        use crate::data::PtpWrite;
        let mut buf = vec![];
        buf.write_ptp_u16(100).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_ptp_u16(0).unwrap();
        buf.write_ptp_str("").unwrap();
        buf.write_ptp_u16(0).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_str("vendor").unwrap();
        buf.write_ptp_str("model").unwrap();
        buf.write_ptp_str("1.0").unwrap();
        buf.write_ptp_str("sn").unwrap();
        buf
    }

    fn open_session(t: &FakeTransport) -> Session<&FakeTransport> {
        let info = device_info_bytes();
        // OpenSession's response is pinned to tx_id = 0; the
        // post-open GetDeviceInfo is the first allocator-drawn
        // transaction, landing on tx_id = 1.
        t.queue_read(container::encode_response(0x2001, 0, &[]));
        t.queue_read(container::encode_data_container(0x1001, 1, &info));
        t.queue_read(container::encode_response(0x2001, 1, &[]));
        SessionBuilder::new().session_id(7).open(t).unwrap()
    }

    #[test]
    fn root_lists_attached_storages_only() {
        let t = FakeTransport::new();
        let mut session = open_session(&t);

        let mut ids = vec![];
        ids.write_u32::<LittleEndian>(2).unwrap();
        ids.write_u32::<LittleEndian>(0x00010001).unwrap();
        ids.write_u32::<LittleEndian>(0x00020000).unwrap(); // unattached
        t.queue_read(container::encode_data_container(0x1004, 2, &ids));
        t.queue_read(container::encode_response(0x2001, 2, &[]));

        let mut tree = Tree::new();
        let children = tree.list(&mut session, NodeKey::Root).unwrap();
        assert_eq!(children, vec![NodeKey::StorageDir(StorageId::from_raw(0x00010001))]);
    }

    #[test]
    fn storage_dir_post_filters_handles_outside_its_parent() {
        let t = FakeTransport::new();
        let mut session = open_session(&t);

        let mut handles = vec![];
        handles.write_u32::<LittleEndian>(2).unwrap();
        handles.write_u32::<LittleEndian>(100).unwrap();
        handles.write_u32::<LittleEndian>(200).unwrap();
        t.queue_read(container::encode_data_container(0x1007, 2, &handles));
        t.queue_read(container::encode_response(0x2001, 2, &[]));

        // object 100: parent 0 (root-level, belongs here)
        let info100 = object_info_bytes("root-level.txt", 0, 0x00010001);
        t.queue_read(container::encode_data_container(0x1008, 3, &info100));
        t.queue_read(container::encode_response(0x2001, 3, &[]));

        // object 200: parent is some other object, should be filtered out
        let info200 = object_info_bytes("nested.txt", 999, 0x00010001);
        t.queue_read(container::encode_data_container(0x1008, 4, &info200));
        t.queue_read(container::encode_response(0x2001, 4, &[]));

        let storage = StorageId::from_raw(0x00010001);
        let mut tree = Tree::new();
        let children = tree.list(&mut session, NodeKey::StorageDir(storage)).unwrap();
        assert_eq!(children, vec![NodeKey::Object(storage, ObjectHandle::from_raw(100))]);
    }

    fn object_info_bytes(filename: &str, parent: u32, storage_id: u32) -> Vec<u8> {
        use crate::data::PtpWrite;
        let mut buf = vec![];
        buf.write_ptp_u32(storage_id).unwrap();
        buf.write_ptp_u16(
            ObjectFormatCode::Standard(StandardObjectFormatCode::Text)
                .to_u16()
                .unwrap(),
        )
        .unwrap();
        buf.write_ptp_u16(0).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u16(
            ObjectFormatCode::Standard(StandardObjectFormatCode::UndefinedNonImage)
                .to_u16()
                .unwrap(),
        )
        .unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u32(parent).unwrap();
        buf.write_ptp_u16(
            AssociationCode::Standard(StandardAssociationCode::Undefined)
                .to_u16()
                .unwrap(),
        )
        .unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_str(filename).unwrap();
        buf.write_ptp_str("").unwrap();
        buf.write_ptp_str("").unwrap();
        buf.write_ptp_str("").unwrap();
        buf
    }

    #[test]
    fn mime_format_falls_back_to_undefined_for_unknown_suffix() {
        assert_eq!(
            mime_format("IMG_0001.jpg"),
            ObjectFormatCode::Standard(StandardObjectFormatCode::ExifJpeg)
        );
        assert_eq!(
            mime_format("noext"),
            ObjectFormatCode::Standard(StandardObjectFormatCode::UndefinedNonImage)
        );
    }

    #[test]
    fn invalidate_drops_children_and_bumps_version() {
        let mut tree = Tree::new();
        tree.nodes.get_mut(&NodeKey::Root).unwrap().cache_state = CacheState::Fresh;
        tree.nodes.get_mut(&NodeKey::Root).unwrap().children =
            vec![NodeKey::StorageDir(StorageId::from_raw(1))];
        tree.nodes.insert(
            NodeKey::StorageDir(StorageId::from_raw(1)),
            Node {
                kind: Kind::StorageDir,
                key: NodeKey::StorageDir(StorageId::from_raw(1)),
                parent: Some(NodeKey::Root),
                filename: "storage-1".into(),
                is_dir: true,
                cache_state: CacheState::Fresh,
                children: vec![],
                size: 0,
                capture_date: String::new(),
                modification_date: String::new(),
            },
        );

        let before = tree.version();
        tree.invalidate(NodeKey::Root);
        assert_eq!(tree.version(), before + 1);
        assert!(!tree.nodes.contains_key(&NodeKey::StorageDir(StorageId::from_raw(1))));
        assert_eq!(
            tree.nodes.get(&NodeKey::Root).unwrap().cache_state,
            CacheState::Stale
        );
    }
}
