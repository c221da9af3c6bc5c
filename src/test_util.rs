//! In-process 9P servers for exercising the client over the loopback
//! transport.
//!
//! [`FakeServer`] drives a closure per incoming frame and is used where
//! a test wants to assert on the exact wire traffic. [`TreeServer`] is
//! a small in-memory 9P2000.L server with real fid bindings and a
//! mutable tree, used by the mount-level scenarios.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use deku::DekuContainerWrite;
use tokio::task::JoinHandle;

use crate::ninep::protocol::*;
use crate::ninep::transport::{ChannelTransport, Transport};

pub fn reply(tag: u16, body: Message) -> P9Message {
    P9Message::new(tag, body)
}

pub fn lerror(tag: u16, errno: i32) -> P9Message {
    P9Message::new(tag, Message::Rlerror(Rlerror { ecode: errno as u32 }))
}

/// Answers each parsed frame with whatever the handler returns.
pub struct FakeServer {
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub fn spawn<F>(transport: ChannelTransport, mut handler: F) -> Self
    where
        F: FnMut(P9Message) -> Option<P9Message> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            while let Ok(frame) = transport.receive().await {
                let msg = P9Message::parse(&frame).expect("client sent an unparseable frame");
                if let Some(resp) = handler(msg) {
                    let bytes = resp.to_bytes().expect("response serialization");
                    if transport.send(&bytes).await.is_err() {
                        break;
                    }
                }
            }
        });
        FakeServer { handle }
    }

    /// Wait for the peer to hang up; propagates handler panics.
    pub async fn finish(self) {
        self.handle.await.expect("fake server panicked");
    }
}

// Linux dirent type constants
const DT_DIR: u8 = 4;
const DT_REG: u8 = 8;
const DT_LNK: u8 = 10;

const MODE_DIR: u32 = 0o040755;
const MODE_REG: u32 = 0o100644;
const MODE_LNK: u32 = 0o120777;

struct Node {
    qid: Qid,
    parent: usize,
    children: Vec<(String, usize)>,
    data: Vec<u8>,
    target: String,
    mode: u32,
    nlink: u64,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.qid.type_ & QT_DIR != 0
    }

    fn dirent_type(&self) -> u8 {
        if self.qid.type_ & QT_DIR != 0 {
            DT_DIR
        } else if self.qid.type_ & QT_SYMLINK != 0 {
            DT_LNK
        } else {
            DT_REG
        }
    }
}

/// A tiny in-memory 9P2000.L server backed by a mutable tree.
pub struct TreeServer {
    nodes: Vec<Node>,
    fids: HashMap<u32, usize>,
    pub msize: u32,
}

pub struct TreeHandle {
    handle: JoinHandle<TreeServer>,
    rpc_count: Arc<AtomicUsize>,
}

impl TreeHandle {
    /// Messages the server has handled so far.
    pub fn rpc_count(&self) -> usize {
        self.rpc_count.load(Ordering::SeqCst)
    }

    /// Wait for the peer to hang up and take the final tree state.
    pub async fn finish(self) -> TreeServer {
        self.handle.await.expect("tree server panicked")
    }
}

impl TreeServer {
    pub fn new() -> Self {
        let root = Node {
            qid: Qid { type_: QT_DIR, version: 0, path: 1 },
            parent: 0,
            children: Vec::new(),
            data: Vec::new(),
            target: String::new(),
            mode: MODE_DIR,
            nlink: 2,
        };
        TreeServer {
            nodes: vec![root],
            fids: HashMap::new(),
            msize: 8192,
        }
    }

    fn next_qid_path(&self) -> u64 {
        self.nodes.iter().map(|n| n.qid.path).max().unwrap_or(0) + 1
    }

    fn add_node(&mut self, parent: usize, name: &str, qtype: u8, mode: u32) -> usize {
        let qid = Qid { type_: qtype, version: 0, path: self.next_qid_path() };
        let index = self.nodes.len();
        self.nodes.push(Node {
            qid,
            parent,
            children: Vec::new(),
            data: Vec::new(),
            target: String::new(),
            mode,
            nlink: if qtype & QT_DIR != 0 { 2 } else { 1 },
        });
        self.nodes[parent].children.push((name.to_string(), index));
        index
    }

    fn resolve(&self, path: &str) -> Option<usize> {
        let mut cur = 0;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            let node = &self.nodes[cur];
            cur = node
                .children
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, idx)| *idx)?;
        }
        Some(cur)
    }

    fn split_parent(&self, path: &str) -> (usize, String) {
        let trimmed = path.trim_matches('/');
        match trimmed.rsplit_once('/') {
            Some((dir, name)) => (self.resolve(dir).expect("parent exists"), name.to_string()),
            None => (0, trimmed.to_string()),
        }
    }

    /// Test-setup helpers; parents must already exist.
    pub fn add_dir(&mut self, path: &str) -> u64 {
        let (parent, name) = self.split_parent(path);
        let idx = self.add_node(parent, &name, QT_DIR, MODE_DIR);
        self.nodes[idx].qid.path
    }

    pub fn add_file(&mut self, path: &str, data: &[u8]) -> u64 {
        let (parent, name) = self.split_parent(path);
        let idx = self.add_node(parent, &name, QT_FILE, MODE_REG);
        self.nodes[idx].data = data.to_vec();
        self.nodes[idx].qid.path
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) -> u64 {
        let (parent, name) = self.split_parent(path);
        let idx = self.add_node(parent, &name, QT_SYMLINK, MODE_LNK);
        self.nodes[idx].target = target.to_string();
        self.nodes[idx].qid.path
    }

    /// Post-condition helpers for tests.
    pub fn qid_path_of(&self, path: &str) -> Option<u64> {
        self.resolve(path).map(|idx| self.nodes[idx].qid.path)
    }

    pub fn file_data(&self, path: &str) -> Option<&[u8]> {
        self.resolve(path).map(|idx| self.nodes[idx].data.as_slice())
    }

    pub fn bound_fids(&self) -> usize {
        self.fids.len()
    }

    pub fn spawn(mut self, transport: ChannelTransport) -> TreeHandle {
        let rpc_count = Arc::new(AtomicUsize::new(0));
        let counter = rpc_count.clone();
        let handle = tokio::spawn(async move {
            while let Ok(frame) = transport.receive().await {
                let msg = P9Message::parse(&frame).expect("client sent an unparseable frame");
                counter.fetch_add(1, Ordering::SeqCst);
                let resp = self.handle(msg);
                let bytes = resp.to_bytes().expect("response serialization");
                if transport.send(&bytes).await.is_err() {
                    break;
                }
            }
            self
        });
        TreeHandle { handle, rpc_count }
    }

    fn node_of_fid(&self, fid: u32) -> Result<usize, i32> {
        self.fids.get(&fid).copied().ok_or(libc::EBADF)
    }

    fn child_of(&self, dir: usize, name: &str) -> Option<usize> {
        self.nodes[dir]
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, idx)| *idx)
    }

    fn stat_of(&self, index: usize) -> Stat {
        let node = &self.nodes[index];
        let size = if node.is_dir() {
            0
        } else if node.qid.type_ & QT_SYMLINK != 0 {
            node.target.len() as u64
        } else {
            node.data.len() as u64
        };
        Stat {
            qid: node.qid,
            mode: node.mode,
            uid: 0,
            gid: 0,
            nlink: node.nlink,
            size,
            blksize: 4096,
            blocks: size.div_ceil(512),
            ..Default::default()
        }
    }

    pub fn handle(&mut self, msg: P9Message) -> P9Message {
        let tag = msg.tag;
        match self.dispatch(msg.body) {
            Ok(body) => reply(tag, body),
            Err(errno) => lerror(tag, errno),
        }
    }

    fn dispatch(&mut self, msg: Message) -> Result<Message, i32> {
        match msg {
            Message::Tversion(tv) => Ok(Message::Rversion(Rversion {
                msize: tv.msize.min(self.msize),
                version: P9String::new(VERSION_9P2000L),
            })),

            Message::Tattach(ta) => {
                self.fids.insert(ta.fid, 0);
                Ok(Message::Rattach(Rattach { qid: self.nodes[0].qid }))
            }

            Message::Twalk(tw) => {
                let start = self.node_of_fid(tw.fid)?;
                let mut cur = start;
                let mut wqids = Vec::new();
                for wname in &tw.wnames {
                    let name = wname.as_str().map_err(|_| libc::EINVAL)?;
                    let next = if name == ".." {
                        self.nodes[cur].parent
                    } else {
                        match self.child_of(cur, name) {
                            Some(idx) => idx,
                            None => break,
                        }
                    };
                    cur = next;
                    wqids.push(self.nodes[cur].qid);
                }
                if wqids.is_empty() && !tw.wnames.is_empty() {
                    return Err(libc::ENOENT);
                }
                if wqids.len() == tw.wnames.len() {
                    self.fids.insert(tw.newfid, cur);
                }
                Ok(Message::Rwalk(Rwalk { nwqid: wqids.len() as u16, wqids }))
            }

            Message::Tlopen(tl) => {
                let node = self.node_of_fid(tl.fid)?;
                Ok(Message::Rlopen(Rlopen { qid: self.nodes[node].qid, iounit: 0 }))
            }

            Message::Tlcreate(tc) => {
                let dir = self.node_of_fid(tc.fid)?;
                let name = tc.name.as_str().map_err(|_| libc::EINVAL)?.to_string();
                if !self.nodes[dir].is_dir() {
                    return Err(libc::ENOTDIR);
                }
                if self.child_of(dir, &name).is_some() {
                    return Err(libc::EEXIST);
                }
                let idx = self.add_node(dir, &name, QT_FILE, tc.mode);
                self.fids.insert(tc.fid, idx); // fid now names the file
                Ok(Message::Rlcreate(Rlcreate { qid: self.nodes[idx].qid, iounit: 0 }))
            }

            Message::Tread(tr) => {
                let node = self.node_of_fid(tr.fid)?;
                let data = &self.nodes[node].data;
                let start = (tr.offset as usize).min(data.len());
                let end = (start + tr.count as usize).min(data.len());
                let chunk = data[start..end].to_vec();
                Ok(Message::Rread(Rread { count: chunk.len() as u32, data: chunk }))
            }

            Message::Twrite(tw) => {
                let node = self.node_of_fid(tw.fid)?;
                if self.nodes[node].is_dir() {
                    return Err(libc::EISDIR);
                }
                let end = tw.offset as usize + tw.data.len();
                let data = &mut self.nodes[node].data;
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[tw.offset as usize..end].copy_from_slice(&tw.data);
                Ok(Message::Rwrite(Rwrite { count: tw.data.len() as u32 }))
            }

            Message::Treaddir(tr) => {
                let dir = self.node_of_fid(tr.fid)?;
                if !self.nodes[dir].is_dir() {
                    return Err(libc::ENOTDIR);
                }
                let mut data = Vec::new();
                let children = self.nodes[dir].children.clone();
                for (i, (name, idx)) in children.iter().enumerate().skip(tr.offset as usize) {
                    let entry = DirEntry {
                        qid: self.nodes[*idx].qid,
                        offset: i as u64 + 1,
                        type_: self.nodes[*idx].dirent_type(),
                        name: P9String::new(name),
                    };
                    let bytes = DekuContainerWrite::to_bytes(&entry).expect("dirent");
                    if data.len() + bytes.len() > tr.count as usize {
                        break;
                    }
                    data.extend_from_slice(&bytes);
                }
                Ok(Message::Rreaddir(Rreaddir { count: data.len() as u32, data }))
            }

            Message::Tgetattr(tg) => {
                let node = self.node_of_fid(tg.fid)?;
                Ok(Message::Rgetattr(Rgetattr {
                    valid: GETATTR_BASIC,
                    stat: self.stat_of(node),
                }))
            }

            Message::Tsetattr(ts) => {
                let node = self.node_of_fid(ts.fid)?;
                if ts.valid & SETATTR_MODE != 0 {
                    self.nodes[node].mode = ts.mode;
                }
                if ts.valid & SETATTR_SIZE != 0 {
                    self.nodes[node].data.resize(ts.size as usize, 0);
                }
                Ok(Message::Rsetattr(Rsetattr))
            }

            Message::Tclunk(tc) => {
                self.fids.remove(&tc.fid).ok_or(libc::EBADF)?;
                Ok(Message::Rclunk(Rclunk))
            }

            Message::Tremove(tr) => {
                let node = self.node_of_fid(tr.fid)?;
                self.fids.remove(&tr.fid);
                let parent = self.nodes[node].parent;
                self.nodes[parent].children.retain(|(_, idx)| *idx != node);
                Ok(Message::Rremove(Rremove))
            }

            Message::Tmkdir(tm) => {
                let dir = self.node_of_fid(tm.dfid)?;
                let name = tm.name.as_str().map_err(|_| libc::EINVAL)?.to_string();
                if self.child_of(dir, &name).is_some() {
                    return Err(libc::EEXIST);
                }
                let idx = self.add_node(dir, &name, QT_DIR, tm.mode);
                Ok(Message::Rmkdir(Rmkdir { qid: self.nodes[idx].qid }))
            }

            Message::Tsymlink(ts) => {
                let dir = self.node_of_fid(ts.dfid)?;
                let name = ts.name.as_str().map_err(|_| libc::EINVAL)?.to_string();
                if self.child_of(dir, &name).is_some() {
                    return Err(libc::EEXIST);
                }
                let target = ts.symtgt.as_str().map_err(|_| libc::EINVAL)?.to_string();
                let idx = self.add_node(dir, &name, QT_SYMLINK, MODE_LNK);
                self.nodes[idx].target = target;
                Ok(Message::Rsymlink(Rsymlink { qid: self.nodes[idx].qid }))
            }

            Message::Treadlink(tr) => {
                let node = self.node_of_fid(tr.fid)?;
                if self.nodes[node].qid.type_ & QT_SYMLINK == 0 {
                    return Err(libc::EINVAL);
                }
                Ok(Message::Rreadlink(Rreadlink {
                    target: P9String::new(&self.nodes[node].target),
                }))
            }

            Message::Tlink(tl) => {
                let dir = self.node_of_fid(tl.dfid)?;
                let node = self.node_of_fid(tl.fid)?;
                let name = tl.name.as_str().map_err(|_| libc::EINVAL)?.to_string();
                if self.child_of(dir, &name).is_some() {
                    return Err(libc::EEXIST);
                }
                self.nodes[dir].children.push((name, node));
                self.nodes[node].nlink += 1;
                Ok(Message::Rlink(Rlink))
            }

            Message::Trenameat(tr) => {
                let old_dir = self.node_of_fid(tr.olddirfid)?;
                let new_dir = self.node_of_fid(tr.newdirfid)?;
                let old_name = tr.oldname.as_str().map_err(|_| libc::EINVAL)?.to_string();
                let new_name = tr.newname.as_str().map_err(|_| libc::EINVAL)?.to_string();

                let moved = self.child_of(old_dir, &old_name).ok_or(libc::ENOENT)?;
                self.nodes[old_dir].children.retain(|(n, _)| n != &old_name);
                self.nodes[new_dir].children.retain(|(n, _)| n != &new_name);
                self.nodes[new_dir].children.push((new_name, moved));
                self.nodes[moved].parent = new_dir;
                Ok(Message::Rrenameat(Rrenameat))
            }

            Message::Tunlinkat(tu) => {
                let dir = self.node_of_fid(tu.dirfid)?;
                let name = tu.name.as_str().map_err(|_| libc::EINVAL)?.to_string();
                let victim = self.child_of(dir, &name).ok_or(libc::ENOENT)?;
                if tu.flags & AT_REMOVEDIR != 0 {
                    if !self.nodes[victim].is_dir() {
                        return Err(libc::ENOTDIR);
                    }
                    if !self.nodes[victim].children.is_empty() {
                        return Err(libc::ENOTEMPTY);
                    }
                } else if self.nodes[victim].is_dir() {
                    return Err(libc::EISDIR);
                }
                self.nodes[dir].children.retain(|(n, _)| n != &name);
                Ok(Message::Runlinkat(Runlinkat))
            }

            Message::Tstatfs(ts) => {
                self.node_of_fid(ts.fid)?;
                Ok(Message::Rstatfs(Rstatfs {
                    r#type: 0x01021997, // V9FS_MAGIC
                    bsize: 4096,
                    blocks: 1000,
                    bfree: 500,
                    bavail: 400,
                    files: 100,
                    ffree: 50,
                    fsid: 7,
                    namelen: 255,
                }))
            }

            Message::Tfsync(tf) => {
                self.node_of_fid(tf.fid)?;
                Ok(Message::Rfsync(Rfsync))
            }

            _ => Err(libc::EOPNOTSUPP),
        }
    }
}
