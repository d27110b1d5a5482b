//! Unit fingerprinting.
//!
//! A fingerprint is the xxh3 hash of a unit's bytes plus the set of units
//! it statically references. For compiled JVM classes the references come
//! from the constant pool and member descriptors; for anything else that
//! decodes as text, from `import` declarations.
//!
//! Fingerprinting never fails: a unit that cannot be located, read or
//! parsed yields the unknown sentinel, which callers treat as changed.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::error::{SkippyError, SkippyResult};
use crate::unit::{ClassFingerprint, UnitHash};

const CLASS_MAGIC: u32 = 0xCAFE_BABE;
const CLASS_EXT: &str = "class";

// ── Unit sources ────────────────────────────────────────────

/// Where unit bytes come from.
pub trait UnitSource: Send + Sync {
    fn read_unit(&self, unit: &str) -> SkippyResult<Vec<u8>>;
}

/// Reads compiled classes from a list of class-output directories.
/// `com.example.Foo$Bar` resolves to `<root>/com/example/Foo$Bar.class`;
/// the first root that has the file wins.
#[derive(Debug, Clone)]
pub struct ClassRootSource {
    roots: Vec<PathBuf>,
    max_unit_bytes: u64,
}

impl ClassRootSource {
    pub fn new(roots: Vec<PathBuf>, max_unit_bytes: u64) -> Self {
        Self {
            roots,
            max_unit_bytes,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn locate(&self, unit: &str) -> Option<PathBuf> {
        let rel = unit_rel_path(unit);
        self.roots
            .iter()
            .map(|root| root.join(&rel))
            .find(|candidate| candidate.is_file())
    }

    /// Every unit found under the roots, keyed by name. Earlier roots shadow
    /// later ones, matching `read_unit`.
    pub fn list_units(&self) -> BTreeMap<String, PathBuf> {
        let mut units = BTreeMap::new();
        for root in &self.roots {
            if !root.is_dir() {
                continue;
            }
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(CLASS_EXT) {
                    continue;
                }
                if let Some(name) = unit_name_for(root, path) {
                    units.entry(name).or_insert_with(|| path.to_path_buf());
                }
            }
        }
        units
    }
}

impl UnitSource for ClassRootSource {
    fn read_unit(&self, unit: &str) -> SkippyResult<Vec<u8>> {
        if !is_unit_name(unit) {
            return Err(SkippyError::unreadable(unit, "not a dotted unit name"));
        }
        let path = self
            .locate(unit)
            .ok_or_else(|| SkippyError::unreadable(unit, "not found under any class root"))?;

        let metadata = fs::metadata(&path).map_err(|e| SkippyError::io(&path, e))?;
        if metadata.len() > self.max_unit_bytes {
            return Err(SkippyError::unreadable(
                unit,
                format!("{} bytes exceeds limit {}", metadata.len(), self.max_unit_bytes),
            ));
        }

        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(SkippyError::unreadable(unit, "removed while reading"))
            }
            Err(err) => Err(SkippyError::io(path, err)),
        }
    }
}

/// In-memory units, for adapters that already hold unit content and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    units: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, name: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert(name, content);
        self
    }

    pub fn insert(&mut self, name: &str, content: impl Into<Vec<u8>>) {
        self.units.insert(name.to_string(), content.into());
    }

    pub fn remove(&mut self, name: &str) {
        self.units.remove(name);
    }
}

impl UnitSource for MemorySource {
    fn read_unit(&self, unit: &str) -> SkippyResult<Vec<u8>> {
        self.units
            .get(unit)
            .cloned()
            .ok_or_else(|| SkippyError::unreadable(unit, "no such unit"))
    }
}

/// Dotted names only: path separators or empty segments could resolve
/// outside the class roots.
fn is_unit_name(unit: &str) -> bool {
    unit.split('.')
        .all(|seg| !seg.is_empty() && !seg.contains(['/', '\\', ':']))
}

fn unit_rel_path(unit: &str) -> PathBuf {
    let mut rel: PathBuf = unit.split('.').collect();
    rel.set_extension(CLASS_EXT);
    rel
}

fn unit_name_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("."))
}

// ── Fingerprinter ───────────────────────────────────────────

#[derive(Clone)]
pub struct Fingerprinter {
    source: Arc<dyn UnitSource>,
}

impl Fingerprinter {
    pub fn new(source: impl UnitSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Fingerprint `unit`, or the unknown sentinel if it cannot be read.
    pub fn fingerprint(&self, unit: &str) -> ClassFingerprint {
        match self.source.read_unit(unit) {
            Ok(bytes) => fingerprint_bytes(unit, &bytes),
            Err(err) => {
                tracing::debug!(unit, error = %err, "unit is unknown");
                ClassFingerprint::unknown(unit)
            }
        }
    }

    pub fn dependencies_of(&self, unit: &str) -> BTreeSet<String> {
        self.fingerprint(unit).dependencies
    }
}

/// Pure fingerprint of already-loaded unit content.
pub fn fingerprint_bytes(unit: &str, bytes: &[u8]) -> ClassFingerprint {
    let hash = UnitHash::of(bytes);
    let mut dependencies = if is_class_file(bytes) {
        match class_file_references(bytes) {
            Ok(refs) => refs,
            Err(reason) => {
                tracing::warn!(unit, %reason, "malformed class file");
                return ClassFingerprint::unknown(unit);
            }
        }
    } else {
        std::str::from_utf8(bytes)
            .map(source_imports)
            .unwrap_or_default()
    };

    dependencies.remove(unit);
    ClassFingerprint::known(unit, hash, dependencies)
}

fn is_class_file(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == CLASS_MAGIC
}

// ── Source imports ──────────────────────────────────────────

lazy_static! {
    static ref IMPORT_RE: Regex =
        Regex::new(r"(?m)^\s*import\s+(static\s+)?([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)(\.\*)?\s*;?\s*$")
            .expect("valid import regex");
    static ref DESCRIPTOR_RE: Regex = Regex::new(r"L([^;\[()]+);").expect("valid descriptor regex");
}

fn source_imports(content: &str) -> BTreeSet<String> {
    let mut imports = BTreeSet::new();
    for caps in IMPORT_RE.captures_iter(content) {
        if caps.get(3).is_some() {
            continue; // wildcard: names a package, not a unit
        }
        let path = &caps[2];
        let name = if caps.get(1).is_some() {
            // static import names a member; the unit is its owner
            match path.rsplit_once('.') {
                Some((owner, _)) => owner,
                None => continue,
            }
        } else {
            path
        };
        imports.insert(name.to_string());
    }
    imports
}

// ── Class files ─────────────────────────────────────────────

struct ClassReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ClassReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| format!("truncated at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u1(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u2(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn skip(&mut self, n: usize) -> Result<(), String> {
        self.take(n).map(|_| ())
    }

    /// Skip a field_info / method_info, returning its descriptor index.
    fn member(&mut self) -> Result<u16, String> {
        self.skip(4)?; // access_flags, name_index
        let descriptor = self.u2()?;
        let attributes = self.u2()?;
        for _ in 0..attributes {
            self.skip(2)?;
            let len = self.u4()? as usize;
            self.skip(len)?;
        }
        Ok(descriptor)
    }
}

/// Names of all classes a compiled class references, in dotted form.
fn class_file_references(bytes: &[u8]) -> Result<BTreeSet<String>, String> {
    let mut r = ClassReader::new(bytes);
    if r.u4()? != CLASS_MAGIC {
        return Err("bad magic".to_string());
    }
    r.skip(4)?; // minor, major

    let count = r.u2()?;
    let mut utf8: HashMap<u16, String> = HashMap::new();
    let mut class_names: BTreeMap<u16, u16> = BTreeMap::new(); // slot -> name utf8
    let mut descriptors: Vec<u16> = Vec::new();

    let mut index = 1u16;
    while index < count {
        let tag = r.u1()?;
        match tag {
            1 => {
                let len = r.u2()? as usize;
                let raw = r.take(len)?;
                utf8.insert(index, String::from_utf8_lossy(raw).into_owned());
            }
            3 | 4 => r.skip(4)?,
            5 | 6 => {
                r.skip(8)?;
                index = index.saturating_add(1); // 8-byte constants take two slots
            }
            7 => {
                class_names.insert(index, r.u2()?);
            }
            8 | 19 | 20 => r.skip(2)?,
            9..=11 | 17 | 18 => r.skip(4)?,
            12 => {
                r.skip(2)?;
                descriptors.push(r.u2()?);
            }
            15 => r.skip(3)?,
            16 => descriptors.push(r.u2()?),
            other => return Err(format!("unknown constant tag {other} at slot {index}")),
        }
        index = index.saturating_add(1);
    }

    r.skip(2)?; // access_flags
    let this_class = r.u2()?;
    r.skip(2)?; // super_class (also in class_names)
    let interfaces = r.u2()? as usize;
    r.skip(interfaces * 2)?;
    for _ in 0..2 {
        // fields, then methods
        let members = r.u2()?;
        for _ in 0..members {
            descriptors.push(r.member()?);
        }
    }

    let this_name = class_names
        .get(&this_class)
        .and_then(|idx| utf8.get(idx))
        .map(|name| internal_to_dotted(name));

    let mut refs = BTreeSet::new();
    for idx in class_names.values() {
        let Some(name) = utf8.get(idx) else {
            return Err(format!("class entry points at missing utf8 {idx}"));
        };
        if name.starts_with('[') {
            refs.extend(descriptor_classes(name));
        } else {
            refs.insert(internal_to_dotted(name));
        }
    }
    for idx in &descriptors {
        if let Some(desc) = utf8.get(idx) {
            refs.extend(descriptor_classes(desc));
        }
    }

    if let Some(own) = this_name {
        refs.remove(&own);
    }
    Ok(refs)
}

fn descriptor_classes(descriptor: &str) -> impl Iterator<Item = String> + '_ {
    DESCRIPTOR_RE
        .captures_iter(descriptor)
        .map(|caps| internal_to_dotted(&caps[1]))
}

fn internal_to_dotted(name: &str) -> String {
    name.replace('/', ".")
}
