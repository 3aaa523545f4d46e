//! Build selection.
//!
//! A [`BuildCache`] lives for one scheduling pass. It keeps a forward-only cursor per
//! (build source, os, arch): builds are paged in newest first only when the builds
//! already cached have all been rejected, so no build is fetched twice in a pass no
//! matter how many testboxes are served from it. Blacklisted and vanished builds are
//! marked removed in place; prerequisite decisions are memoized per build and
//! prerequisite signature.

use crate::model::*;
use crate::req_expr::Requirement;
use crate::store::{self, BuildCursorKey};
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap};

/// Whether a build's binaries are still where the build record says.
pub trait ArtifactProbe: Send + Sync {
    fn build_artifacts_exist(&self, build: &Build) -> bool;
}

/// Trusts every build record.
pub struct NoArtifactProbe;

impl ArtifactProbe for NoArtifactProbe {
    fn build_artifacts_exist(&self, _build: &Build) -> bool {
        true
    }
}

/// Checks build binaries on a local or mounted build share. Entries are
/// comma-separated; relative paths resolve under `root` and URLs are trusted.
pub struct FsArtifactProbe {
    pub root: Utf8PathBuf,
}

impl FsArtifactProbe {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactProbe for FsArtifactProbe {
    fn build_artifacts_exist(&self, build: &Build) -> bool {
        build
            .binaries
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .all(|entry| {
                if entry.contains("://") {
                    return true;
                }
                let path = Utf8Path::new(entry);
                let full = if path.is_absolute() { path.to_owned() } else { self.root.join(path) };
                full.exists()
            })
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
struct CursorKey {
    build_source_id: BuildSourceId,
    os: String,
    arch: String,
}

#[derive(Clone, Debug)]
struct CachedBuild {
    build: Build,
    removed: bool,
    blacklist_checked: bool,
}

#[derive(Debug, Default)]
struct BuildCursor {
    builds: Vec<CachedBuild>,
    last_key: Option<BuildCursorKey>,
    exhausted: bool,
}

/// What a candidate build has to satisfy.
pub struct BuildQuery<'a> {
    pub source: &'a BuildSource,
    pub test_box: &'a TestBox,
    /// Build requirement filters, all of which must match.
    pub filters: &'a [&'a Requirement],
    /// Test cases that must have passed against the build.
    pub prereqs: &'a BTreeSet<TestCaseId>,
    pub now: Timestamp,
}

pub struct BuildCache {
    cursors: HashMap<CursorKey, BuildCursor>,
    prereq_decisions: HashMap<(BuildId, String), bool>,
    page_size: usize,
    pages_fetched: usize,
}

impl BuildCache {
    pub fn new(page_size: usize) -> Self {
        Self {
            cursors: Default::default(),
            prereq_decisions: Default::default(),
            page_size: page_size.max(1),
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Newest acceptable build for a testbox, or `None` when no cached or fetchable
    /// build survives every check.
    pub fn find_build(
        &mut self,
        conn: &rusqlite::Connection,
        query: &BuildQuery<'_>,
        probe: &dyn ArtifactProbe,
    ) -> anyhow::Result<Option<Build>> {
        let (os, arch) = (query.test_box.os.as_str(), query.test_box.arch.as_str());
        if !query.source.covers_os_arch(os, arch) {
            return Ok(None);
        }
        let key = CursorKey {
            build_source_id: query.source.id,
            os: os.to_owned(),
            arch: arch.to_owned(),
        };
        let signature = query.prereqs.iter().join(",");

        let mut index = 0;
        loop {
            if index >= self.cursor(&key).builds.len() {
                if !self.fetch_next_page(conn, &key, query.source, query.now)? {
                    return Ok(None);
                }
                continue;
            }

            let candidate = &self.cursor(&key).builds[index];
            if candidate.removed {
                index += 1;
                continue;
            }
            let build = candidate.build.clone();
            let blacklist_checked = candidate.blacklist_checked;

            if !query.source.accepts_type(&build.build_type)
                || !query.filters.iter().all(|req| req.matches(&build))
            {
                index += 1;
                continue;
            }

            if !blacklist_checked {
                let blacklisted = store::is_build_blacklisted(conn, &build, query.now)?;
                let entry = &mut self.cursor_mut(&key).builds[index];
                entry.blacklist_checked = true;
                if blacklisted {
                    tracing::debug!("Build #{} r{} is blacklisted", build.id, build.revision);
                    entry.removed = true;
                    index += 1;
                    continue;
                }
            }

            if !self.prereqs_satisfied(conn, &build, query.prereqs, &signature)? {
                index += 1;
                continue;
            }

            if !probe.build_artifacts_exist(&build) {
                tracing::info!("Build #{} binaries are gone: {}", build.id, build.binaries);
                self.cursor_mut(&key).builds[index].removed = true;
                index += 1;
                continue;
            }

            return Ok(Some(build));
        }
    }

    /// Newest validation kit build from a validation-kit build source. Validation kits
    /// are os and arch agnostic and have no prerequisites.
    pub fn find_validation_kit_build(
        &mut self,
        conn: &rusqlite::Connection,
        source: &BuildSource,
        now: Timestamp,
        probe: &dyn ArtifactProbe,
    ) -> anyhow::Result<Option<Build>> {
        let agnostic_box = agnostic_test_box();
        let no_prereqs = BTreeSet::new();
        let query = BuildQuery {
            source,
            test_box: &agnostic_box,
            filters: &[],
            prereqs: &no_prereqs,
            now,
        };
        self.find_build(conn, &query, probe)
    }

    fn cursor(&mut self, key: &CursorKey) -> &BuildCursor {
        self.cursor_mut(key)
    }

    fn cursor_mut(&mut self, key: &CursorKey) -> &mut BuildCursor {
        self.cursors.entry(key.clone()).or_default()
    }

    /// Pulls the next page into a cursor. Returns false once the cursor is drained.
    fn fetch_next_page(
        &mut self,
        conn: &rusqlite::Connection,
        key: &CursorKey,
        source: &BuildSource,
        now: Timestamp,
    ) -> anyhow::Result<bool> {
        let page_size = self.page_size;
        let cursor = self.cursor_mut(key);
        if cursor.exhausted {
            return Ok(false);
        }
        let page = store::fetch_build_page(conn, source, &key.os, &key.arch, now, cursor.last_key, page_size)?;
        if page.len() < page_size {
            cursor.exhausted = true;
        }
        if let Some(last) = page.last() {
            cursor.last_key = Some((last.ts_created, last.id));
        }
        let fetched = !page.is_empty();
        cursor.builds.extend(page.into_iter().map(|build| CachedBuild {
            build,
            removed: false,
            blacklist_checked: false,
        }));
        self.pages_fetched += 1;
        Ok(fetched)
    }

    fn prereqs_satisfied(
        &mut self,
        conn: &rusqlite::Connection,
        build: &Build,
        prereqs: &BTreeSet<TestCaseId>,
        signature: &str,
    ) -> anyhow::Result<bool> {
        if prereqs.is_empty() {
            return Ok(true);
        }
        let memo_key = (build.id, signature.to_owned());
        if let Some(&decision) = self.prereq_decisions.get(&memo_key) {
            return Ok(decision);
        }
        let mut decision = true;
        for &test_case_id in prereqs {
            let (good, bad) = store::prereq_run_counts(conn, build.id, test_case_id)?;
            if good == 0 || bad > 0 {
                tracing::debug!(
                    "Build #{} blocked by prerequisite test case #{} ({} good, {} bad runs)",
                    build.id,
                    test_case_id,
                    good,
                    bad
                );
                decision = false;
                break;
            }
        }
        self.prereq_decisions.insert(memo_key, decision);
        Ok(decision)
    }

    /// Forgets memoized prerequisite decisions for a build, after one of its test sets
    /// finished and the run counts changed.
    pub fn invalidate_prereq_decisions(&mut self, build_id: BuildId) {
        self.prereq_decisions.retain(|(id, _), _| *id != build_id);
    }
}

fn agnostic_test_box() -> TestBox {
    TestBox {
        id: 0,
        generation_id: 0,
        name: String::new(),
        ip: String::new(),
        os: OS_AGNOSTIC.to_owned(),
        arch: ARCH_AGNOSTIC.to_owned(),
        cpu_vendor: String::new(),
        cpu_count: 1,
        mem_mb: 0,
        scratch_mb: 0,
        has_hw_virt: false,
        has_nested_paging: false,
        has_64bit_guest: false,
        has_iommu: false,
        timeout_scale_pct: 100,
        enabled: true,
        properties: Default::default(),
    }
}
