//! Feed OpenStreetMap PBF extracts into a middle store.
//!
//! Responsibilities:
//! - Decode nodes, dense nodes, ways and relations with `osmpbf`.
//! - Convert them into middle records and forward them to the matching
//!   `*_set` operation.
//!
//! Boundaries:
//! - Lifecycle calls (`build_indexes`, `stop`) stay with the caller.
//! - No geometry building; output stages read through `QueryView`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat};
use log::{info, warn};
use middle_core::{
    Attributes, Connector, Coordinate, Member, MemberKind, MiddleError, MiddleStore, PointRecord,
    PrimitiveId, RelationRecord, Tags, WayRecord,
};
use osmpbf::{DenseNodeInfo, Element, ElementReader, Info, RelMemberType};
use thiserror::Error;

/// Counts of elements forwarded to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Points stored, including dense-node entries.
    pub points: u64,
    /// Ways stored.
    pub ways: u64,
    /// Relations stored.
    pub relations: u64,
    /// Points skipped because their location cannot be represented.
    pub skipped: u64,
}

impl LoadSummary {
    const fn combine(self, other: Self) -> Self {
        Self {
            points: self.points + other.points,
            ways: self.ways + other.ways,
            relations: self.relations + other.relations,
            skipped: self.skipped + other.skipped,
        }
    }

    const fn point() -> Self {
        Self {
            points: 1,
            ways: 0,
            relations: 0,
            skipped: 0,
        }
    }

    const fn way() -> Self {
        Self {
            points: 0,
            ways: 1,
            relations: 0,
            skipped: 0,
        }
    }

    const fn relation() -> Self {
        Self {
            points: 0,
            ways: 0,
            relations: 1,
            skipped: 0,
        }
    }

    const fn skipped() -> Self {
        Self {
            points: 0,
            ways: 0,
            relations: 0,
            skipped: 1,
        }
    }
}

/// Errors returned by [`load_osm_pbf`].
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be opened.
    #[error("failed to open OSM PBF file at {path:?}")]
    Open {
        /// Underlying reader error.
        #[source]
        source: osmpbf::Error,
        /// Requested path.
        path: PathBuf,
    },
    /// The file is not valid PBF data.
    #[error("failed to decode OSM PBF data at {path:?}")]
    Decode {
        /// Underlying reader error.
        #[source]
        source: osmpbf::Error,
        /// Requested path.
        path: PathBuf,
    },
    /// The store rejected an element.
    #[error("failed to store {kind} {id}")]
    Store {
        /// `"point"`, `"way"` or `"relation"`.
        kind: &'static str,
        /// Element id.
        id: PrimitiveId,
        /// Store error.
        #[source]
        source: MiddleError,
    },
}

fn collect_tags<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> Tags {
    pairs
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

/// Render a PBF timestamp as `YYYY-MM-DDTHH:MM:SSZ`. Zero marks an unset
/// timestamp in PBF files.
fn iso_timestamp(milliseconds: i64) -> Option<String> {
    if milliseconds == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(milliseconds)
        .map(|instant| instant.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn attributes(info: &Info<'_>) -> Attributes {
    Attributes {
        version: info.version(),
        timestamp: info.milli_timestamp().and_then(iso_timestamp),
        changeset: info.changeset(),
        uid: info.uid(),
        user: info.user().and_then(Result::ok).map(str::to_owned),
    }
}

fn dense_attributes(info: &DenseNodeInfo<'_>) -> Attributes {
    Attributes {
        version: Some(info.version()),
        timestamp: iso_timestamp(info.milli_timestamp()),
        changeset: Some(info.changeset()),
        uid: Some(info.uid()),
        user: info.user().ok().map(str::to_owned),
    }
}

const fn member_kind(kind: RelMemberType) -> MemberKind {
    match kind {
        RelMemberType::Node => MemberKind::Point,
        RelMemberType::Way => MemberKind::Way,
        RelMemberType::Relation => MemberKind::Relation,
    }
}

struct Loader<'s, C: Connector> {
    store: &'s MiddleStore<C>,
    attributes: bool,
}

impl<C: Connector> Loader<'_, C> {
    fn store_error(kind: &'static str, id: PrimitiveId) -> impl FnOnce(MiddleError) -> LoadError {
        move |source| LoadError::Store { kind, id, source }
    }

    fn point(
        &self,
        id: PrimitiveId,
        (lon, lat): (f64, f64),
        tags: Tags,
        attributes: Option<Attributes>,
    ) -> Result<LoadSummary, LoadError> {
        let Some(location) = Coordinate::from_degrees(lon, lat) else {
            warn!("skipping point {id}: location ({lon}, {lat}) is out of range");
            return Ok(LoadSummary::skipped());
        };
        let point = PointRecord {
            tags,
            attributes,
            ..PointRecord::new(id, location)
        };
        self.store
            .point_set(&point)
            .map_err(Self::store_error("point", id))?;
        Ok(LoadSummary::point())
    }

    fn way(&self, way: &osmpbf::Way<'_>) -> Result<LoadSummary, LoadError> {
        let record = WayRecord {
            id: way.id(),
            nodes: way.refs().collect(),
            tags: collect_tags(way.tags()),
            attributes: self.attributes.then(|| attributes(&way.info())),
        };
        self.store
            .way_set(&record)
            .map_err(Self::store_error("way", record.id))?;
        Ok(LoadSummary::way())
    }

    fn relation(&self, relation: &osmpbf::Relation<'_>) -> Result<LoadSummary, LoadError> {
        let id = relation.id();
        let members = relation
            .members()
            .map(|member| {
                let role = member.role().unwrap_or_else(|err| {
                    warn!("relation {id}: unreadable member role ({err}); storing it empty");
                    ""
                });
                Member::new(member_kind(member.member_type), member.member_id, role)
            })
            .collect();
        let record = RelationRecord {
            id,
            members,
            tags: collect_tags(relation.tags()),
            attributes: self.attributes.then(|| attributes(&relation.info())),
        };
        self.store
            .relation_set(&record)
            .map_err(Self::store_error("relation", id))?;
        Ok(LoadSummary::relation())
    }

    fn element(&self, element: Element<'_>) -> Result<LoadSummary, LoadError> {
        match element {
            Element::Node(node) => self.point(
                node.id(),
                (node.lon(), node.lat()),
                collect_tags(node.tags()),
                self.attributes.then(|| attributes(&node.info())),
            ),
            Element::DenseNode(node) => self.point(
                node.id(),
                (node.lon(), node.lat()),
                collect_tags(node.tags()),
                node.info()
                    .filter(|_| self.attributes)
                    .map(|info| dense_attributes(&info)),
            ),
            Element::Way(way) => self.way(&way),
            Element::Relation(relation) => self.relation(&relation),
        }
    }
}

fn merge(
    lhs: Result<LoadSummary, LoadError>,
    rhs: Result<LoadSummary, LoadError>,
) -> Result<LoadSummary, LoadError> {
    Ok(lhs?.combine(rhs?))
}

/// Decode `path` in parallel and store every element in `store`.
///
/// The store must be accepting mutations: a create run still `Loading` or an
/// append run. Elements whose location cannot be represented are skipped with
/// a warning. The first store error is returned once decoding finishes.
///
/// # Examples
/// ```no_run
/// use std::path::Path;
/// use camino::Utf8PathBuf;
/// use middle_core::{MiddleConfig, MiddleStore, SqliteConnector};
/// use middle_data::load_osm_pbf;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MiddleStore::open(
///     SqliteConnector::new(Utf8PathBuf::from("middle.db")),
///     MiddleConfig::default(),
/// )?;
/// let summary = load_osm_pbf(Path::new("planet.osm.pbf"), &store)?;
/// println!("Stored {} ways", summary.ways);
/// store.stop()?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// Returns [`LoadError::Open`] when the file cannot be opened,
/// [`LoadError::Decode`] for malformed data, and [`LoadError::Store`] when the
/// store rejects an element.
pub fn load_osm_pbf<C: Connector>(
    path: &Path,
    store: &MiddleStore<C>,
) -> Result<LoadSummary, LoadError> {
    let reader = ElementReader::from_path(path).map_err(|source| LoadError::Open {
        source,
        path: path.to_path_buf(),
    })?;
    let loader = Loader {
        store,
        attributes: store.config().extra_attributes,
    };
    let summary = reader
        .par_map_reduce(
            |element| loader.element(element),
            || Ok(LoadSummary::default()),
            merge,
        )
        .map_err(|source| LoadError::Decode {
            source,
            path: path.to_path_buf(),
        })??;
    info!(
        "loaded {} points, {} ways and {} relations from {} ({} points skipped)",
        summary.points,
        summary.ways,
        summary.relations,
        path.display(),
        summary.skipped
    );
    Ok(summary)
}
