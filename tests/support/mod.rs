//! In-memory `File`/`Lock`/`State` double used only by this crate's own
//! integration tests (spec.md §1 treats the real dependency database as an
//! external collaborator; this is not a product deliverable).

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use redo_core::{DepKind, File, FileId, Lock, State, STAMP_MISSING};

#[derive(Debug, Clone, Default)]
struct Record {
    name: String,
    generated: bool,
    override_: bool,
    static_: bool,
    checked: bool,
    changed: bool,
    failed: bool,
    stamp: u64,
    csum: Option<String>,
    deps: Vec<(DepKind, String)>,
}

type Records = Rc<RefCell<HashMap<FileId, Record>>>;

/// An in-process stamp/lock database good enough to drive `Orchestrator`
/// end to end against a real filesystem, with no real persistence.
pub struct MemState {
    records: Records,
    by_name: Rc<RefCell<HashMap<String, FileId>>>,
    next_id: Rc<Cell<FileId>>,
    held: Rc<RefCell<HashSet<FileId>>>,
    sane: bool,
}

impl MemState {
    pub fn new() -> Self {
        MemState {
            records: Rc::new(RefCell::new(HashMap::new())),
            by_name: Rc::new(RefCell::new(HashMap::new())),
            next_id: Rc::new(Cell::new(1)),
            held: Rc::new(RefCell::new(HashSet::new())),
            sane: true,
        }
    }

    /// Force `check_sane()` to report the state directory as gone, for
    /// exercising rv 205.
    pub fn make_insane(&mut self) {
        self.sane = false;
    }

    /// True if `id` is currently held by some [`MemLock`].
    pub fn is_locked(&self, id: FileId) -> bool {
        self.held.borrow().contains(&id)
    }
}

impl State for MemState {
    type F = MemFile;
    type L = MemLock;

    fn file(&mut self, path: &str) -> Result<Self::F, Box<dyn StdError + Send + Sync>> {
        let id = {
            let mut by_name = self.by_name.borrow_mut();
            *by_name.entry(path.to_string()).or_insert_with(|| {
                let id = self.next_id.get();
                self.next_id.set(id + 1);
                self.records.borrow_mut().insert(
                    id,
                    Record {
                        name: path.to_string(),
                        stamp: STAMP_MISSING,
                        ..Record::default()
                    },
                );
                id
            })
        };
        Ok(MemFile {
            id,
            name: path.to_string(),
            records: self.records.clone(),
        })
    }

    fn file_by_id(&mut self, id: FileId) -> Result<Self::F, Box<dyn StdError + Send + Sync>> {
        let name = self
            .records
            .borrow()
            .get(&id)
            .map(|r| r.name.clone())
            .ok_or_else(|| format!("no such file id {id}"))?;
        Ok(MemFile {
            id,
            name,
            records: self.records.clone(),
        })
    }

    fn lock(&mut self, id: FileId) -> Self::L {
        MemLock {
            id,
            held: self.held.clone(),
            owned: false,
        }
    }

    fn commit(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>> {
        Ok(())
    }

    fn check_sane(&self) -> bool {
        self.sane
    }

    fn warn_override(&self, name: &str) {
        eprintln!("warning: {name} was modified outside the build");
    }
}

pub struct MemFile {
    id: FileId,
    name: String,
    records: Records,
}

impl MemFile {
    fn with<T>(&self, f: impl FnOnce(&Record) -> T) -> T {
        f(self.records.borrow().get(&self.id).expect("dangling file id"))
    }

    fn with_mut<T>(&mut self, f: impl FnOnce(&mut Record) -> T) -> T {
        f(self.records.borrow_mut().get_mut(&self.id).expect("dangling file id"))
    }
}

impl File for MemFile {
    fn id(&self) -> FileId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_generated(&self) -> bool {
        self.with(|r| r.generated)
    }
    fn is_override(&self) -> bool {
        self.with(|r| r.override_)
    }
    fn is_static(&self) -> bool {
        self.with(|r| r.static_)
    }
    fn is_checked(&self) -> bool {
        self.with(|r| r.checked)
    }
    fn is_changed(&self) -> bool {
        self.with(|r| r.changed)
    }
    fn is_failed(&self) -> bool {
        self.with(|r| r.failed)
    }

    fn set_generated(&mut self, v: bool) {
        self.with_mut(|r| r.generated = v);
    }
    fn set_override(&mut self, v: bool) {
        self.with_mut(|r| r.override_ = v);
    }
    fn set_static(&mut self, v: bool) {
        self.with_mut(|r| r.static_ = v);
    }
    fn set_checked(&mut self, v: bool) {
        self.with_mut(|r| r.checked = v);
    }
    fn set_changed(&mut self, v: bool) {
        self.with_mut(|r| r.changed = v);
    }
    fn set_failed(&mut self, v: bool) {
        self.with_mut(|r| r.failed = v);
    }

    fn stamp(&self) -> u64 {
        self.with(|r| r.stamp)
    }
    fn set_stamp(&mut self, stamp: u64) {
        self.with_mut(|r| r.stamp = stamp);
    }

    fn csum(&self) -> Option<&str> {
        None
    }
    fn clear_csum(&mut self) {
        self.with_mut(|r| r.csum = None);
    }

    fn add_dep(&mut self, kind: DepKind, path: &str) {
        self.with_mut(|r| r.deps.push((kind, path.to_string())));
    }
    fn zap_deps1(&mut self) {
        self.with_mut(|r| r.deps.clear());
    }
    fn zap_deps2(&mut self) {}

    fn refresh(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>> {
        Ok(())
    }
    fn save(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>> {
        Ok(())
    }

    fn read_stamp(&self, base: &Path) -> u64 {
        match std::fs::metadata(base.join(&self.name)) {
            Ok(m) => stamp_from_metadata(&m),
            Err(_) => STAMP_MISSING,
        }
    }

    fn update_stamp(&mut self, base: &Path) {
        let s = self.read_stamp(base);
        self.set_stamp(s);
    }
}

fn stamp_from_metadata(m: &std::fs::Metadata) -> u64 {
    // Not a format this crate specifies: big enough to
    // change whenever size or mtime does, which is all these tests need.
    (m.size() << 32) ^ (m.mtime() as u64) ^ (m.mtime_nsec() as u64)
}

pub struct MemLock {
    id: FileId,
    held: Rc<RefCell<HashSet<FileId>>>,
    owned: bool,
}

impl Lock for MemLock {
    fn trylock(&mut self) -> Result<bool, Box<dyn StdError + Send + Sync>> {
        if self.owned {
            return Ok(true);
        }
        let mut held = self.held.borrow_mut();
        if held.contains(&self.id) {
            Ok(false)
        } else {
            held.insert(self.id);
            self.owned = true;
            Ok(true)
        }
    }

    fn waitlock(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.trylock()? {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err("timed out waiting for lock in the in-memory test double".into());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn unlock(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>> {
        if self.owned {
            self.held.borrow_mut().remove(&self.id);
            self.owned = false;
        }
        Ok(())
    }

    fn owned(&self) -> bool {
        self.owned
    }
}
