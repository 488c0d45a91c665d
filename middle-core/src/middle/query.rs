//! Read-side resolution of way node lists and relation members.
//!
//! Lookups go cache-first: the RAM tier, then the overflow tier, then one
//! batched prepared query against the backing store for whatever is still
//! missing. Misses are values, never errors.

use std::collections::HashMap;
use std::fmt;

use geo::LineString;

use crate::backing::{BackingStore, Connector, Row, Value};
use crate::model::{Coordinate, Member, MemberKind, PrimitiveId, RelationRecord, WayRecord};
use crate::table::{
    DecodeError, Statement, TableKind, coordinate_from_cells, relation_from_cells, way_from_cells,
};

use super::{MiddleError, MiddleStore, id_column, register_statements};

/// A way with the location of each node, in node order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWay {
    /// The stored way.
    pub way: WayRecord,
    /// One slot per node; `None` marks a point that could not be found.
    pub locations: Vec<Option<Coordinate>>,
}

impl ResolvedWay {
    /// Whether every node resolved.
    pub fn is_complete(&self) -> bool {
        self.locations.iter().all(Option::is_some)
    }

    /// Node ids that did not resolve, in node order.
    pub fn missing(&self) -> Vec<PrimitiveId> {
        self.way
            .nodes
            .iter()
            .zip(&self.locations)
            .filter(|(_, location)| location.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// The resolved subset as a line string, skipping missing nodes.
    pub fn to_line_string(&self) -> LineString<f64> {
        self.locations
            .iter()
            .flatten()
            .map(|coordinate| coordinate.to_geo())
            .collect()
    }
}

/// Outcome of [`QueryView::resolve_way`].
#[derive(Debug, Clone, PartialEq)]
pub enum WayResolution {
    /// No way is stored under the id.
    NotFound,
    /// Every node resolved.
    Complete(ResolvedWay),
    /// Some nodes are missing; their slots are `None`.
    Incomplete(ResolvedWay),
}

impl WayResolution {
    /// The resolved way, complete or not.
    pub const fn resolved(&self) -> Option<&ResolvedWay> {
        match self {
            Self::NotFound => None,
            Self::Complete(way) | Self::Incomplete(way) => Some(way),
        }
    }
}

/// What a relation member points at, one level deep.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberTarget {
    /// Location of a point member.
    Point(Option<Coordinate>),
    /// A way member's record.
    Way(Option<WayRecord>),
    /// A nested relation, left for the caller to resolve.
    Relation,
}

impl MemberTarget {
    const fn is_missing(&self) -> bool {
        matches!(self, Self::Point(None) | Self::Way(None))
    }
}

/// A member with its kind and role exactly as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMember {
    /// The stored member entry.
    pub member: Member,
    /// What the member resolved to.
    pub target: MemberTarget,
}

/// A relation with each member resolved one level deep.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRelation {
    /// The stored relation.
    pub relation: RelationRecord,
    /// Members in stored order.
    pub members: Vec<ResolvedMember>,
}

/// Outcome of [`QueryView::resolve_relation`].
#[derive(Debug, Clone, PartialEq)]
pub enum RelationResolution {
    /// No relation is stored under the id.
    NotFound,
    /// Every point and way member resolved.
    Complete(ResolvedRelation),
    /// Some point or way members are missing.
    Incomplete(ResolvedRelation),
}

fn id_list(ids: &[PrimitiveId]) -> Value {
    let joined = ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    Value::Text(format!("[{joined}]"))
}

/// Read-only access to a [`MiddleStore`] in `Ready`.
///
/// Each view owns a backing store connection, so output workers can hold one
/// view per thread. The view borrows the store and cannot outlive it.
pub struct QueryView<'a, C: Connector> {
    store: &'a MiddleStore<C>,
    connection: C::Store,
}

impl<C: Connector> fmt::Debug for QueryView<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryView")
            .field("store", self.store)
            .finish_non_exhaustive()
    }
}

impl<'a, C: Connector> QueryView<'a, C> {
    pub(super) fn new(store: &'a MiddleStore<C>) -> Result<Self, MiddleError> {
        let backing = |source| MiddleError::Backing {
            operation: "open query connection",
            source,
        };
        let mut connection = store.connector().connect().map_err(backing)?;
        register_statements(&mut connection, store.tables()).map_err(backing)?;
        Ok(Self { store, connection })
    }

    fn exec(
        &mut self,
        table: TableKind,
        statement: Statement,
        params: &[Value],
        operation: &'static str,
    ) -> Result<Vec<Row>, MiddleError> {
        let name = self.store.tables().get(table).statement_name(statement);
        self.connection
            .exec_prepared(&name, params)
            .map_err(|source| MiddleError::Backing { operation, source })
    }

    /// Fetch one way.
    ///
    /// # Errors
    /// Returns backing store and decode failures; a missing way is `None`.
    pub fn way_get(&mut self, id: PrimitiveId) -> Result<Option<WayRecord>, MiddleError> {
        let rows = self.exec(TableKind::Ways, Statement::Get, &[Value::Integer(id)], "fetch way")?;
        match rows.first() {
            Some(row) => Ok(Some(way_from_cells(id, row)?)),
            None => Ok(None),
        }
    }

    /// Fetch one relation.
    ///
    /// # Errors
    /// Returns backing store and decode failures; a missing relation is
    /// `None`.
    pub fn relation_get(&mut self, id: PrimitiveId) -> Result<Option<RelationRecord>, MiddleError> {
        let rows = self.exec(
            TableKind::Relations,
            Statement::Get,
            &[Value::Integer(id)],
            "fetch relation",
        )?;
        match rows.first() {
            Some(row) => Ok(Some(relation_from_cells(id, row)?)),
            None => Ok(None),
        }
    }

    /// Fetch several ways in one round trip, keyed by id.
    fn ways_by_id(
        &mut self,
        ids: &[PrimitiveId],
    ) -> Result<HashMap<PrimitiveId, WayRecord>, MiddleError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self.exec(
            TableKind::Ways,
            Statement::GetMany,
            &[id_list(ids)],
            "fetch ways",
        )?;
        let mut ways = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some((first, cells)) = row.split_first() else {
                continue;
            };
            let id = first.as_i64().ok_or_else(|| DecodeError {
                table: TableKind::Ways,
                id: None,
                reason: "id column is not an integer".to_owned(),
            })?;
            ways.insert(id, way_from_cells(id, cells)?);
        }
        Ok(ways)
    }

    /// Locations of `nodes`, in order, with `None` for points that cannot
    /// be found anywhere.
    ///
    /// # Errors
    /// Returns overflow tier, backing store and decode failures.
    pub fn resolve_way_nodes(
        &mut self,
        nodes: &[PrimitiveId],
    ) -> Result<Vec<Option<Coordinate>>, MiddleError> {
        let mut locations = Vec::with_capacity(nodes.len());
        let mut missing = Vec::new();
        {
            let mut cache = self.store.lock_cache()?;
            for &id in nodes {
                let location = cache.get(id)?;
                if location.is_none() {
                    missing.push(id);
                }
                locations.push(location);
            }
        }
        if missing.is_empty() {
            return Ok(locations);
        }

        missing.sort_unstable();
        missing.dedup();
        let rows = self.exec(
            TableKind::Points,
            Statement::GetMany,
            &[id_list(&missing)],
            "fetch points",
        )?;
        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let mut cells = row.iter();
            let id = cells.next().and_then(Value::as_i64);
            let coordinate = coordinate_from_cells(id, cells.next(), cells.next())?;
            if let Some(id) = id {
                found.insert(id, coordinate);
            }
        }
        for (slot, id) in locations.iter_mut().zip(nodes) {
            if slot.is_none() {
                *slot = found.get(id).copied();
            }
        }
        Ok(locations)
    }

    /// Fetch way `id` and resolve its node list.
    ///
    /// # Errors
    /// As for [`Self::way_get`] and [`Self::resolve_way_nodes`].
    pub fn resolve_way(&mut self, id: PrimitiveId) -> Result<WayResolution, MiddleError> {
        let Some(way) = self.way_get(id)? else {
            return Ok(WayResolution::NotFound);
        };
        let locations = self.resolve_way_nodes(&way.nodes)?;
        let resolved = ResolvedWay { way, locations };
        Ok(if resolved.is_complete() {
            WayResolution::Complete(resolved)
        } else {
            WayResolution::Incomplete(resolved)
        })
    }

    /// Every stored way member of relation `id`, in member order. Missing
    /// ways are skipped. Nested relations are not followed.
    ///
    /// # Errors
    /// Returns backing store and decode failures.
    pub fn way_members(&mut self, id: PrimitiveId) -> Result<Vec<WayRecord>, MiddleError> {
        let Some(relation) = self.relation_get(id)? else {
            return Ok(Vec::new());
        };
        let way_ids = Self::member_ids(&relation, MemberKind::Way);
        let ways = self.ways_by_id(&way_ids)?;
        Ok(relation
            .members
            .iter()
            .filter(|member| member.kind == MemberKind::Way)
            .filter_map(|member| ways.get(&member.id).cloned())
            .collect())
    }

    fn member_ids(relation: &RelationRecord, kind: MemberKind) -> Vec<PrimitiveId> {
        let mut ids: Vec<_> = relation
            .members
            .iter()
            .filter(|member| member.kind == kind)
            .map(|member| member.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Fetch relation `id` and resolve each member one level deep.
    ///
    /// Roles and kinds are returned verbatim. Point members carry their
    /// location, way members their record; relation members are not
    /// followed.
    ///
    /// # Errors
    /// Returns cache, backing store and decode failures.
    pub fn resolve_relation(&mut self, id: PrimitiveId) -> Result<RelationResolution, MiddleError> {
        let Some(relation) = self.relation_get(id)? else {
            return Ok(RelationResolution::NotFound);
        };
        let point_ids = Self::member_ids(&relation, MemberKind::Point);
        let points: HashMap<_, _> = point_ids
            .iter()
            .copied()
            .zip(self.resolve_way_nodes(&point_ids)?)
            .collect();
        let ways = self.ways_by_id(&Self::member_ids(&relation, MemberKind::Way))?;

        let members: Vec<_> = relation
            .members
            .iter()
            .map(|member| ResolvedMember {
                member: member.clone(),
                target: match member.kind {
                    MemberKind::Point => {
                        MemberTarget::Point(points.get(&member.id).copied().flatten())
                    }
                    MemberKind::Way => MemberTarget::Way(ways.get(&member.id).cloned()),
                    MemberKind::Relation => MemberTarget::Relation,
                },
            })
            .collect();
        let complete = !members.iter().any(|member| member.target.is_missing());
        let resolved = ResolvedRelation { relation, members };
        Ok(if complete {
            RelationResolution::Complete(resolved)
        } else {
            RelationResolution::Incomplete(resolved)
        })
    }

    /// Ids of relations with way `way_id` as a member, ascending.
    ///
    /// # Errors
    /// Returns backing store and decode failures.
    pub fn relations_using_way(
        &mut self,
        way_id: PrimitiveId,
    ) -> Result<Vec<PrimitiveId>, MiddleError> {
        let rows = self.exec(
            TableKind::Relations,
            Statement::RelationsByMember,
            &[Value::from(MemberKind::Way.code()), Value::Integer(way_id)],
            "look up relations using way",
        )?;
        Ok(id_column(TableKind::Relations, rows)?)
    }

    /// Ids of ways containing point `point_id`, ascending.
    ///
    /// # Errors
    /// Returns backing store and decode failures.
    pub fn ways_using_point(
        &mut self,
        point_id: PrimitiveId,
    ) -> Result<Vec<PrimitiveId>, MiddleError> {
        let rows = self.exec(
            TableKind::Ways,
            Statement::WaysByNode,
            &[Value::Integer(point_id)],
            "look up ways using point",
        )?;
        Ok(id_column(TableKind::Ways, rows)?)
    }
}
