//! In-memory fixture backend and scenario tests covering the planner's
//! testable properties: cascade propagation (single-hop and chained), the fast-path
//! batched `UPDATE`, `Protect` aggregation, `Restrict` raising and being
//! rescued by a concurrent cascade, and `SetNull`.
//!
//! The fixture plays the role `agent::controllers::test_util` plays for
//! `agent`'s own controller tests: a minimal, fully in-process stand-in
//! for the real storage layer, built once per test rather than shared.

use crate::collector::UpdateCollector;
use crate::error::CascadeError;
use crate::instance::{Instance, RowKey, RowValue};
use crate::interfaces::{
    Backend, ConnectionRegistry, QueryCompiler, QuerySetLike, SchemaView, SignalBus,
    TransactionManager,
};
use crate::planner::UpdateReport;
use crate::schema::{
    Field, ModelId, ModelMeta, OnUpdateTag, PrivateField, RemoteField, SchemaGraph,
};
use crate::traversal::{collect_update, CollectOptions};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

fn row_key_of(value: &RowValue) -> Option<RowKey> {
    match value {
        RowValue::Int(v) => Some(RowKey::Int(*v)),
        RowValue::Text(v) => Some(RowKey::Text(v.clone())),
        RowValue::Uuid(v) => Some(RowKey::Uuid(*v)),
        _ => None,
    }
}

fn leaf(label: &str, idx: u32, fields: Vec<Field>) -> ModelMeta {
    ModelMeta {
        label: label.to_string(),
        concrete: ModelId(idx),
        parents: IndexMap::new(),
        fields,
        private_fields: Vec::new(),
        auto_created: false,
    }
}

fn fk(name: &str, target: ModelId, target_field: &str, on_update: OnUpdateTag) -> Field {
    Field {
        name: name.to_string(),
        remote: Some(RemoteField {
            target_model: target,
            target_field: target_field.to_string(),
            on_update,
            nullable: matches!(on_update, OnUpdateTag::SetNull),
            lazy_sub_objs: false,
            set_payload: None,
            custom_handler: None,
            auto_created: true,
            concrete: false,
            one_to_one: false,
            one_to_many: true,
            hidden: false,
        }),
    }
}

fn fk_with_payload(
    name: &str,
    target: ModelId,
    target_field: &str,
    on_update: OnUpdateTag,
    payload: RowValue,
) -> Field {
    let mut field = fk(name, target, target_field, on_update);
    field.remote.as_mut().unwrap().set_payload = Some(payload);
    field
}

type Row = IndexMap<String, RowValue>;
type Table = IndexMap<RowKey, Row>;
type Db = HashMap<ModelId, Table>;

#[derive(Clone)]
struct FakeQuerySet {
    model: ModelId,
    pks: Vec<RowKey>,
    db: Arc<Mutex<Db>>,
}

impl QuerySetLike for FakeQuerySet {
    fn model(&self) -> ModelId {
        self.model
    }

    fn has_cached_results(&self) -> bool {
        false
    }

    fn is_select_related(&self) -> bool {
        false
    }

    fn only(&self, _fields: &[String]) -> Self {
        self.clone()
    }

    fn union(self, other: Self) -> Self {
        let mut pks = self.pks;
        for pk in other.pks {
            if !pks.contains(&pk) {
                pks.push(pk);
            }
        }
        FakeQuerySet { pks, ..self }
    }

    async fn update_field(&self, field: &str, value: RowValue) -> anyhow::Result<u64> {
        let mut db = self.db.lock().unwrap();
        let table = db.entry(self.model).or_default();
        let mut count = 0;
        for pk in &self.pks {
            if let Some(row) = table.get_mut(pk) {
                row.insert(field.to_string(), value.clone());
                count += 1;
            }
        }
        Ok(count)
    }
}

/// An in-memory stand-in for every consumed capability, backing a
/// `HashMap`-of-tables database behind a shared `Mutex` so queryset-likes
/// handed back from `related_objects` can still write through `update_field`.
struct FakeBackend {
    graph: SchemaGraph,
    db: Arc<Mutex<Db>>,
    listeners: HashSet<ModelId>,
    batch_size: usize,
    log: Mutex<Vec<String>>,
    /// The name of the field whose value doubles as a model's table key, for
    /// models where that isn't the literal `"id"` (e.g. `Tree.name`,
    /// `RecursiveRef1.name`). Defaults to `"id"`.
    pk_fields: HashMap<ModelId, String>,
    /// When set, `update_batch` against this model fails every call, so
    /// tests can observe which error-handling path a given plan takes.
    fail_update_batch_for: Option<ModelId>,
    marked_for_rollback: Mutex<bool>,
}

impl FakeBackend {
    fn new(graph: SchemaGraph) -> Self {
        FakeBackend {
            graph,
            db: Arc::new(Mutex::new(HashMap::new())),
            listeners: HashSet::new(),
            batch_size: 1000,
            log: Mutex::new(Vec::new()),
            pk_fields: HashMap::new(),
            fail_update_batch_for: None,
            marked_for_rollback: Mutex::new(false),
        }
    }

    fn with_listener(mut self, model: ModelId) -> Self {
        self.listeners.insert(model);
        self
    }

    fn with_pk_field(mut self, model: ModelId, field: &str) -> Self {
        self.pk_fields.insert(model, field.to_string());
        self
    }

    fn with_failing_update_batch(mut self, model: ModelId) -> Self {
        self.fail_update_batch_for = Some(model);
        self
    }

    fn was_marked_for_rollback(&self) -> bool {
        *self.marked_for_rollback.lock().unwrap()
    }

    fn seed(&self, model: ModelId, pk: RowKey, fields: Vec<(&str, RowValue)>) -> Instance {
        let mut row = Row::new();
        for (name, value) in &fields {
            row.insert(name.to_string(), value.clone());
        }
        self.db.lock().unwrap().entry(model).or_default().insert(pk.clone(), row.clone());
        Instance::with_fields(model, pk, false, row)
    }

    fn field_of(&self, model: ModelId, pk: &RowKey, field: &str) -> Option<RowValue> {
        self.db
            .lock()
            .unwrap()
            .get(&model)?
            .get(pk)?
            .get(field)
            .cloned()
    }

    fn row_count(&self, model: ModelId) -> usize {
        self.db.lock().unwrap().get(&model).map(|t| t.len()).unwrap_or(0)
    }
}

impl SchemaView for FakeBackend {
    fn graph(&self) -> &SchemaGraph {
        &self.graph
    }
}

impl SignalBus for FakeBackend {
    fn has_listeners(&self, model: ModelId) -> bool {
        self.listeners.contains(&model)
    }

    async fn send_pre_save(&self, model: ModelId, instance: &Instance, _using: &str) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("pre_save:{}:{:?}", self.graph.model(model).label, instance.key()));
        Ok(())
    }

    async fn send_post_save(&self, model: ModelId, instance: &Instance, _using: &str) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("post_save:{}:{:?}", self.graph.model(model).label, instance.key()));
        Ok(())
    }
}

impl ConnectionRegistry for FakeBackend {
    fn bulk_batch_size(&self, _using: &str, _fields: &[String], _obj_count: usize) -> usize {
        self.batch_size
    }
}

impl TransactionManager for FakeBackend {
    type Txn = ();

    async fn begin(&self, _using: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn commit(&self, _txn: ()) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rollback(&self, _txn: ()) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_for_rollback_on_error(&self, _using: &str) -> anyhow::Result<()> {
        *self.marked_for_rollback.lock().unwrap() = true;
        Ok(())
    }
}

impl QueryCompiler for FakeBackend {
    type Txn = ();
    type QuerySet = FakeQuerySet;

    async fn update_batch(
        &self,
        _txn: &mut (),
        model: ModelId,
        pks: &[RowKey],
        values: &[(String, RowValue)],
    ) -> anyhow::Result<u64> {
        if self.fail_update_batch_for == Some(model) {
            anyhow::bail!("forced update_batch failure for test");
        }
        let mut db = self.db.lock().unwrap();
        let table = db.entry(model).or_default();
        let pk_field = self.pk_fields.get(&model).map(String::as_str).unwrap_or("id");
        let mut count = 0;
        for pk in pks {
            let Some(mut row) = table.shift_remove(pk) else {
                continue;
            };
            let mut new_pk = pk.clone();
            for (field, value) in values {
                if field == pk_field {
                    if let Some(k) = row_key_of(value) {
                        new_pk = k;
                    }
                }
                row.insert(field.clone(), value.clone());
            }
            table.insert(new_pk, row);
            count += 1;
        }
        Ok(count)
    }

    async fn related_objects(
        &self,
        _txn: &mut (),
        related_model: ModelId,
        fields: &[String],
        objs: &[Instance],
    ) -> anyhow::Result<FakeQuerySet> {
        let field = &fields[0];
        // Mirrors a real `WHERE <field> = ANY($1)`: the value searched for is
        // whatever `field`'s own `to_field` names on `model`, which is not
        // necessarily that row's own table identity (a unique non-pk column
        // can be the cascade target, same as Django's `to_field`).
        let target_field = self
            .graph
            .field(related_model, field)
            .and_then(|f| f.remote.as_ref())
            .map(|r| r.target_field.as_str());
        let keys: Vec<RowValue> = objs
            .iter()
            .map(|o| match target_field.and_then(|tf| o.get(tf)) {
                Some(v) => v,
                None => o.key().into(),
            })
            .collect();
        let db = self.db.lock().unwrap();
        let mut pks = Vec::new();
        if let Some(table) = db.get(&related_model) {
            for (pk, row) in table {
                if let Some(v) = row.get(field) {
                    if keys.contains(v) {
                        pks.push(pk.clone());
                    }
                }
            }
        }
        Ok(FakeQuerySet {
            model: related_model,
            pks,
            db: self.db.clone(),
        })
    }

    async fn materialize(&self, _txn: &mut (), qs: &FakeQuerySet) -> anyhow::Result<Vec<Instance>> {
        let db = self.db.lock().unwrap();
        let Some(table) = db.get(&qs.model) else {
            return Ok(Vec::new());
        };
        Ok(qs
            .pks
            .iter()
            .filter_map(|pk| table.get(pk).map(|row| Instance::with_fields(qs.model, pk.clone(), false, row.clone())))
            .collect())
    }

    async fn bulk_related_objects(
        &self,
        _txn: &mut (),
        _field: &PrivateField,
        _objs: &[Instance],
    ) -> anyhow::Result<Vec<Instance>> {
        Ok(Vec::new())
    }
}

async fn run_update(
    backend: &FakeBackend,
    objs: Vec<Instance>,
    field: &str,
    value: RowValue,
) -> Result<UpdateReport, CascadeError> {
    let origin = objs[0].model();
    let mut collector = UpdateCollector::new("default", Some(origin));
    let mut txn = backend.begin("default").await.map_err(CascadeError::from)?;
    collect_update(
        &mut collector,
        backend,
        &mut txn,
        objs,
        field,
        value,
        CollectOptions::default(),
    )
    .await?;
    collector.update(backend).await.map_err(CascadeError::from)
}

const AUTHOR: ModelId = ModelId(0);
const BOOK: ModelId = ModelId(1);

fn author_book_schema(on_update: OnUpdateTag) -> SchemaGraph {
    SchemaGraph::new(vec![
        leaf("Author", 0, vec![Field::local("id")]),
        leaf(
            "Book",
            1,
            vec![Field::local("id"), fk("author_id", AUTHOR, "id", on_update)],
        ),
    ])
}

#[tokio::test]
async fn cascade_updates_dependent_foreign_key() {
    let backend = FakeBackend::new(author_book_schema(OnUpdateTag::Cascade)).with_listener(BOOK);
    let author = backend.seed(AUTHOR, RowKey::Int(1), vec![]);
    backend.seed(BOOK, RowKey::Int(10), vec![("author_id", RowValue::Int(1))]);

    let report = run_update(&backend, vec![author], "id", RowValue::Int(2))
        .await
        .expect("cascade should succeed");

    assert_eq!(report.total, 2);
    assert_eq!(report.per_label.get("Author"), Some(&1));
    assert_eq!(report.per_label.get("Book"), Some(&1));
    assert_eq!(
        backend.field_of(BOOK, &RowKey::Int(10), "author_id"),
        Some(RowValue::Int(2))
    );
    assert_eq!(backend.row_count(AUTHOR), 1);

    let log = backend.log.lock().unwrap();
    assert!(log.iter().any(|l| l.starts_with("pre_save:Book")));
    assert!(log.iter().any(|l| l.starts_with("post_save:Book")));
}

#[tokio::test]
async fn cascade_chains_through_a_shared_key_field() {
    // Region.id doubles as the foreign key into Country (a parent-link /
    // one-to-one-as-primary-key relation), so a cascade into Region's own
    // `id` column continues on into whatever references Region by that same
    // name — here, City.region_id.
    const COUNTRY: ModelId = ModelId(0);
    const REGION: ModelId = ModelId(1);
    const CITY: ModelId = ModelId(2);

    let graph = SchemaGraph::new(vec![
        leaf("Country", 0, vec![Field::local("id")]),
        leaf(
            "Region",
            1,
            vec![fk("id", COUNTRY, "id", OnUpdateTag::Cascade)],
        ),
        leaf(
            "City",
            2,
            vec![Field::local("id"), fk("region_id", REGION, "id", OnUpdateTag::Cascade)],
        ),
    ]);
    let backend = FakeBackend::new(graph);
    let country = backend.seed(COUNTRY, RowKey::Int(1), vec![]);
    backend.seed(REGION, RowKey::Int(1), vec![]);
    backend.seed(CITY, RowKey::Int(50), vec![("region_id", RowValue::Int(1))]);

    let report = run_update(&backend, vec![country], "id", RowValue::Int(9))
        .await
        .expect("chained cascade should succeed");

    assert_eq!(report.total, 3);
    assert_eq!(backend.row_count(COUNTRY), 1);
    assert!(backend.db.lock().unwrap()[&REGION].contains_key(&RowKey::Int(9)));
    assert_eq!(
        backend.field_of(CITY, &RowKey::Int(50), "region_id"),
        Some(RowValue::Int(9))
    );
}

#[tokio::test]
async fn fast_path_issues_one_batched_update_with_no_listeners() {
    // No listeners anywhere, Book has no further candidate relations and no
    // private GFK, so the Author->Book cascade edge qualifies for the
    // deferred fast path instead of materializing Book instances.
    let backend = FakeBackend::new(author_book_schema(OnUpdateTag::Cascade));
    let author = backend.seed(AUTHOR, RowKey::Int(1), vec![]);
    backend.seed(BOOK, RowKey::Int(10), vec![("author_id", RowValue::Int(1))]);
    backend.seed(BOOK, RowKey::Int(11), vec![("author_id", RowValue::Int(1))]);

    let report = run_update(&backend, vec![author], "id", RowValue::Int(7))
        .await
        .expect("fast path cascade should succeed");

    assert_eq!(report.per_label.get("Book"), Some(&2));
    assert_eq!(
        backend.field_of(BOOK, &RowKey::Int(10), "author_id"),
        Some(RowValue::Int(7))
    );
    assert_eq!(
        backend.field_of(BOOK, &RowKey::Int(11), "author_id"),
        Some(RowValue::Int(7))
    );
    // No listeners were registered anywhere, so no signal is ever dispatched.
    assert!(backend.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn protect_aggregates_every_offending_relation() {
    const PUBLISHER: ModelId = ModelId(0);
    const BOOK_P: ModelId = ModelId(1);
    const CONTRACT: ModelId = ModelId(2);

    let graph = SchemaGraph::new(vec![
        leaf("Publisher", 0, vec![Field::local("id")]),
        leaf(
            "Book",
            1,
            vec![fk("publisher_id", PUBLISHER, "id", OnUpdateTag::Protect)],
        ),
        leaf(
            "Contract",
            2,
            vec![fk("publisher_id", PUBLISHER, "id", OnUpdateTag::Protect)],
        ),
    ]);
    let backend = FakeBackend::new(graph);
    let publisher = backend.seed(PUBLISHER, RowKey::Int(1), vec![]);
    backend.seed(BOOK_P, RowKey::Int(10), vec![("publisher_id", RowValue::Int(1))]);
    backend.seed(CONTRACT, RowKey::Int(20), vec![("publisher_id", RowValue::Int(1))]);

    let err = run_update(&backend, vec![publisher], "id", RowValue::Int(2))
        .await
        .expect_err("protect should refuse the update");

    match err {
        CascadeError::Protected(protected) => {
            assert_eq!(protected.model, "Publisher");
            assert!(protected.keys.contains("Book.publisher_id"));
            assert!(protected.keys.contains("Contract.publisher_id"));
            assert_eq!(protected.protected_objects.len(), 2);
        }
        other => panic!("expected Protected, got {other:?}"),
    }
    // Nothing was written: Protect fails the whole collect before any
    // transaction is opened for the write phase.
    assert_eq!(
        backend.field_of(PUBLISHER, &RowKey::Int(1), "id"),
        None
    );
}

#[tokio::test]
async fn restrict_raises_when_nothing_rescues_it() {
    const PUBLISHER: ModelId = ModelId(0);
    const BOOK_R: ModelId = ModelId(1);

    let graph = SchemaGraph::new(vec![
        leaf("Publisher", 0, vec![Field::local("id")]),
        leaf(
            "Book",
            1,
            vec![fk("publisher_id", PUBLISHER, "id", OnUpdateTag::Restrict)],
        ),
    ]);
    let backend = FakeBackend::new(graph);
    let publisher = backend.seed(PUBLISHER, RowKey::Int(1), vec![]);
    backend.seed(BOOK_R, RowKey::Int(10), vec![("publisher_id", RowValue::Int(1))]);

    let err = run_update(&backend, vec![publisher], "id", RowValue::Int(2))
        .await
        .expect_err("restrict should refuse the update");

    assert!(matches!(err, CascadeError::Restricted(_)));
}

#[tokio::test]
async fn restrict_is_rescued_by_a_concurrent_cascade_of_the_same_rows() {
    // Diamond: Book references Publisher through two separate fields — one
    // `Restrict`, one `Cascade`. Both relations are walked from the same
    // `collect` call over Publisher, so the `Cascade` field's recursion adds
    // Book's row to `data` before restriction-resolution runs at the end of
    // `collect_update`, rescuing the `Restrict` field's claim on that same
    // row.
    const PUBLISHER: ModelId = ModelId(0);
    const BOOK_D: ModelId = ModelId(1);

    let graph = SchemaGraph::new(vec![
        leaf("Publisher", 0, vec![Field::local("id")]),
        leaf(
            "Book",
            1,
            vec![
                fk("publisher_id", PUBLISHER, "id", OnUpdateTag::Restrict),
                fk("owner_publisher_id", PUBLISHER, "id", OnUpdateTag::Cascade),
            ],
        ),
    ]);
    let backend = FakeBackend::new(graph);
    let publisher = backend.seed(PUBLISHER, RowKey::Int(1), vec![]);
    backend.seed(
        BOOK_D,
        RowKey::Int(10),
        vec![
            ("publisher_id", RowValue::Int(1)),
            ("owner_publisher_id", RowValue::Int(1)),
        ],
    );

    let report = run_update(&backend, vec![publisher], "id", RowValue::Int(2))
        .await
        .expect("the cascade field should rescue the row the restrict field claimed");

    assert_eq!(
        backend.field_of(BOOK_D, &RowKey::Int(10), "owner_publisher_id"),
        Some(RowValue::Int(2))
    );
    assert_eq!(report.per_label.get("Book"), Some(&1));
}

#[tokio::test]
async fn set_null_clears_dependents_when_the_referenced_row_changes() {
    const AUTHOR_N: ModelId = ModelId(0);
    const BOOK_N: ModelId = ModelId(1);

    let graph = SchemaGraph::new(vec![
        leaf("Author", 0, vec![Field::local("id")]),
        leaf(
            "Book",
            1,
            vec![fk("author_id", AUTHOR_N, "id", OnUpdateTag::SetNull)],
        ),
    ]);
    let backend = FakeBackend::new(graph).with_listener(BOOK_N);
    let author = backend.seed(AUTHOR_N, RowKey::Int(1), vec![]);
    backend.seed(BOOK_N, RowKey::Int(10), vec![("author_id", RowValue::Int(1))]);

    let report = run_update(&backend, vec![author], "id", RowValue::Int(2))
        .await
        .expect("set null should succeed");

    assert_eq!(report.per_label.get("Book"), Some(&1));
    assert_eq!(
        backend.field_of(BOOK_N, &RowKey::Int(10), "author_id"),
        Some(RowValue::Null)
    );
}

#[tokio::test]
async fn set_default_writes_the_configured_payload() {
    const AUTHOR_D: ModelId = ModelId(0);
    const BOOK_D2: ModelId = ModelId(1);

    let graph = SchemaGraph::new(vec![
        leaf("Author", 0, vec![Field::local("id")]),
        leaf(
            "Book",
            1,
            vec![fk_with_payload(
                "author_id",
                AUTHOR_D,
                "id",
                OnUpdateTag::SetDefault,
                RowValue::Int(0),
            )],
        ),
    ]);
    let backend = FakeBackend::new(graph).with_listener(BOOK_D2);
    let author = backend.seed(AUTHOR_D, RowKey::Int(1), vec![]);
    backend.seed(BOOK_D2, RowKey::Int(10), vec![("author_id", RowValue::Int(1))]);

    run_update(&backend, vec![author], "id", RowValue::Int(2))
        .await
        .expect("set default should succeed");

    assert_eq!(
        backend.field_of(BOOK_D2, &RowKey::Int(10), "author_id"),
        Some(RowValue::Int(0))
    );
}

#[tokio::test]
async fn empty_collection_is_a_no_op() {
    let backend = FakeBackend::new(author_book_schema(OnUpdateTag::DoNothing));
    let collector = UpdateCollector::<FakeBackend>::new("default", None);
    let report = collector.update(&backend).await.expect("empty update is a no-op");
    assert_eq!(report.total, 0);
    assert!(report.per_label.is_empty());
}

#[tokio::test]
async fn self_referential_tree_renames_direct_children_only() {
    // Tree(name) is its own foreign target via `parent_name`.
    // Renaming the root must reach `root_c1`/`root_c2` (direct children) but
    // must not touch their own children (the grandchildren), since a `Tree`
    // row's `parent_name` column only ever references its immediate parent.
    const TREE: ModelId = ModelId(0);

    let graph = SchemaGraph::new(vec![ModelMeta {
        label: "Tree".to_string(),
        concrete: TREE,
        parents: IndexMap::new(),
        fields: vec![
            Field::local("name"),
            fk("parent_name", TREE, "name", OnUpdateTag::Cascade),
        ],
        private_fields: Vec::new(),
        auto_created: false,
    }]);
    let backend = FakeBackend::new(graph).with_listener(TREE).with_pk_field(TREE, "name");
    let root = backend.seed(TREE, RowKey::Text("root".into()), vec![("name", RowValue::Text("root".into()))]);
    backend.seed(
        TREE,
        RowKey::Text("root_c1".into()),
        vec![
            ("name", RowValue::Text("root_c1".into())),
            ("parent_name", RowValue::Text("root".into())),
        ],
    );
    backend.seed(
        TREE,
        RowKey::Text("root_c2".into()),
        vec![
            ("name", RowValue::Text("root_c2".into())),
            ("parent_name", RowValue::Text("root".into())),
        ],
    );
    backend.seed(
        TREE,
        RowKey::Text("root_c1_gc".into()),
        vec![
            ("name", RowValue::Text("root_c1_gc".into())),
            ("parent_name", RowValue::Text("root_c1".into())),
        ],
    );

    run_update(
        &backend,
        vec![root],
        "name",
        RowValue::Text("new_root".into()),
    )
    .await
    .expect("renaming the root should cascade to its direct children");

    assert_eq!(
        backend.field_of(TREE, &RowKey::Text("root_c1".into()), "parent_name"),
        Some(RowValue::Text("new_root".into()))
    );
    assert_eq!(
        backend.field_of(TREE, &RowKey::Text("root_c2".into()), "parent_name"),
        Some(RowValue::Text("new_root".into()))
    );
    // Grandchild still points at the untouched `root_c1`.
    assert_eq!(
        backend.field_of(TREE, &RowKey::Text("root_c1_gc".into()), "parent_name"),
        Some(RowValue::Text("root_c1".into()))
    );
}

#[tokio::test]
async fn mutual_recursive_fk_orders_the_cycle_without_a_transient_violation() {
    // RecursiveRef1.name <-> RecursiveRef2.fk, plus
    // RecursiveRef1.rev_fk which also targets RecursiveRef2.fk, forming a
    // true cycle in `dependencies`. `sort` must detect this and leave
    // ordering unchanged rather than looping forever; both rows still end up
    // consistent because fast-path batched UPDATEs don't check inline FK
    // constraints against each other (the transaction is assumed to defer
    // constraint checking). Row identity is each model's own surrogate
    // `id`, distinct from the `name`/`fk` columns being cascaded, matching
    // how the referenced relations actually key off those columns rather
    // than off the row itself.
    const REF1: ModelId = ModelId(0);
    const REF2: ModelId = ModelId(1);

    let graph = SchemaGraph::new(vec![
        ModelMeta {
            label: "RecursiveRef1".to_string(),
            concrete: REF1,
            parents: IndexMap::new(),
            fields: vec![
                Field::local("id"),
                Field::local("name"),
                fk("rev_fk", REF2, "fk", OnUpdateTag::Cascade),
            ],
            private_fields: Vec::new(),
            auto_created: false,
        },
        ModelMeta {
            label: "RecursiveRef2".to_string(),
            concrete: REF2,
            parents: IndexMap::new(),
            fields: vec![
                Field::local("id"),
                fk("fk", REF1, "name", OnUpdateTag::Cascade),
            ],
            private_fields: Vec::new(),
            auto_created: false,
        },
    ]);
    let backend = FakeBackend::new(graph).with_listener(REF1).with_listener(REF2);
    let ref1 = backend.seed(
        REF1,
        RowKey::Int(1),
        vec![
            ("name", RowValue::Text("foo".into())),
            ("rev_fk", RowValue::Text("foo".into())),
        ],
    );
    backend.seed(REF2, RowKey::Int(2), vec![("fk", RowValue::Text("foo".into()))]);

    let report = run_update(&backend, vec![ref1], "name", RowValue::Text("bar".into()))
        .await
        .expect("mutual cycle should still resolve under deferred constraint checking");

    assert_eq!(report.per_label.get("RecursiveRef2"), Some(&1));
    assert_eq!(
        backend.field_of(REF2, &RowKey::Int(2), "fk"),
        Some(RowValue::Text("bar".into()))
    );
    assert_eq!(
        backend.field_of(REF1, &RowKey::Int(1), "rev_fk"),
        Some(RowValue::Text("bar".into()))
    );
}

#[tokio::test]
async fn parent_link_is_updated_before_the_child_in_a_multi_table_inheritance_chain() {
    // `Place` is the multi-table-inheritance parent of
    // `Restaurant`; renaming `Place.name` must also walk up into the parent
    // row (here modeled the other way: updating Restaurant's own parent-link
    // field cascades the shared identity into Place) and the parent must
    // land before the child in `dependencies`.
    const PLACE: ModelId = ModelId(0);
    const RESTAURANT: ModelId = ModelId(1);

    let graph = SchemaGraph::new(vec![
        leaf("Place", 0, vec![Field::local("id")]),
        ModelMeta {
            label: "Restaurant".to_string(),
            concrete: RESTAURANT,
            parents: {
                let mut p = IndexMap::new();
                p.insert(
                    PLACE,
                    crate::schema::ParentLink {
                        field_name: "place_ptr_id".to_string(),
                    },
                );
                p
            },
            fields: vec![fk("place_ptr_id", PLACE, "id", OnUpdateTag::Cascade)],
            private_fields: Vec::new(),
            auto_created: false,
        },
    ]);
    let backend = FakeBackend::new(graph).with_listener(PLACE).with_listener(RESTAURANT);
    let place = backend.seed(PLACE, RowKey::Int(1), vec![]);
    backend.seed(RESTAURANT, RowKey::Int(1), vec![("place_ptr_id", RowValue::Int(1))]);

    let report = run_update(&backend, vec![place], "id", RowValue::Int(9))
        .await
        .expect("parent-link cascade should succeed");

    assert_eq!(report.per_label.get("Place"), Some(&1));
    assert_eq!(report.per_label.get("Restaurant"), Some(&1));
    assert_eq!(
        backend.field_of(RESTAURANT, &RowKey::Int(1), "place_ptr_id"),
        Some(RowValue::Int(9))
    );
}

#[tokio::test]
async fn generic_foreign_key_dependents_are_collected_through_bulk_related_objects() {
    // A private field with no on-update policy of its own
    // still needs its dependents reconciled, discovered via the private
    // field's `bulk_related_objects` capability rather than a normal
    // candidate relation.
    const TAG_TARGET: ModelId = ModelId(0);
    const TAGGED_ITEM: ModelId = ModelId(1);

    let graph = SchemaGraph::new(vec![
        ModelMeta {
            label: "TagTarget".to_string(),
            concrete: TAG_TARGET,
            parents: IndexMap::new(),
            fields: vec![Field::local("id")],
            private_fields: vec![PrivateField {
                name: "tagged_items".to_string(),
                has_bulk_related_objects: true,
            }],
            auto_created: false,
        },
        leaf(
            "TaggedItem",
            1,
            vec![Field::local("id"), fk("object_id", TAG_TARGET, "id", OnUpdateTag::DoNothing)],
        ),
    ]);

    struct GfkBackend {
        inner: FakeBackend,
    }
    impl SchemaView for GfkBackend {
        fn graph(&self) -> &SchemaGraph {
            self.inner.graph()
        }
    }
    impl SignalBus for GfkBackend {
        fn has_listeners(&self, model: ModelId) -> bool {
            self.inner.has_listeners(model)
        }
        async fn send_pre_save(&self, model: ModelId, instance: &Instance, using: &str) -> anyhow::Result<()> {
            self.inner.send_pre_save(model, instance, using).await
        }
        async fn send_post_save(&self, model: ModelId, instance: &Instance, using: &str) -> anyhow::Result<()> {
            self.inner.send_post_save(model, instance, using).await
        }
    }
    impl ConnectionRegistry for GfkBackend {
        fn bulk_batch_size(&self, using: &str, fields: &[String], obj_count: usize) -> usize {
            self.inner.bulk_batch_size(using, fields, obj_count)
        }
    }
    impl TransactionManager for GfkBackend {
        type Txn = ();
        async fn begin(&self, using: &str) -> anyhow::Result<()> {
            self.inner.begin(using).await
        }
        async fn commit(&self, txn: ()) -> anyhow::Result<()> {
            self.inner.commit(txn).await
        }
        async fn rollback(&self, txn: ()) -> anyhow::Result<()> {
            self.inner.rollback(txn).await
        }
        async fn mark_for_rollback_on_error(&self, using: &str) -> anyhow::Result<()> {
            self.inner.mark_for_rollback_on_error(using).await
        }
    }
    impl QueryCompiler for GfkBackend {
        type Txn = ();
        type QuerySet = FakeQuerySet;
        async fn update_batch(
            &self,
            txn: &mut (),
            model: ModelId,
            pks: &[RowKey],
            values: &[(String, RowValue)],
        ) -> anyhow::Result<u64> {
            self.inner.update_batch(txn, model, pks, values).await
        }
        async fn related_objects(
            &self,
            txn: &mut (),
            related_model: ModelId,
            fields: &[String],
            objs: &[Instance],
        ) -> anyhow::Result<FakeQuerySet> {
            self.inner.related_objects(txn, related_model, fields, objs).await
        }
        async fn materialize(&self, txn: &mut (), qs: &FakeQuerySet) -> anyhow::Result<Vec<Instance>> {
            self.inner.materialize(txn, qs).await
        }
        async fn bulk_related_objects(
            &self,
            _txn: &mut (),
            field: &PrivateField,
            objs: &[Instance],
        ) -> anyhow::Result<Vec<Instance>> {
            assert_eq!(field.name, "tagged_items");
            let db = self.inner.db.lock().unwrap();
            let Some(table) = db.get(&TAGGED_ITEM) else {
                return Ok(Vec::new());
            };
            let keys: Vec<RowValue> = objs.iter().map(|o| o.key().into()).collect();
            Ok(table
                .iter()
                .filter(|(_, row)| row.get("object_id").map(|v| keys.contains(v)).unwrap_or(false))
                .map(|(pk, row)| Instance::with_fields(TAGGED_ITEM, pk.clone(), false, row.clone()))
                .collect())
        }
    }

    let backend = GfkBackend {
        inner: FakeBackend::new(graph).with_listener(TAGGED_ITEM),
    };
    let target = backend.inner.seed(TAG_TARGET, RowKey::Int(1), vec![]);
    backend
        .inner
        .seed(TAGGED_ITEM, RowKey::Int(5), vec![("object_id", RowValue::Int(1))]);

    let mut collector = UpdateCollector::new("default", Some(TAG_TARGET));
    let mut txn = backend.begin("default").await.unwrap();
    collect_update(
        &mut collector,
        &backend,
        &mut txn,
        vec![target],
        "id",
        RowValue::Int(2),
        CollectOptions::default(),
    )
    .await
    .expect("gfk walk should collect the tagged item");
    let report = collector.update(&backend).await.expect("update should succeed");

    // The tagged item itself has no cascading FK (`DoNothing`) and no field
    // of its own is being propagated into, so it is only collected and
    // re-saved (signals fire) rather than having any column rewritten or
    // counted in `per_label`.
    assert!(report.per_label.get("TaggedItem").is_none());
    let log = backend.inner.log.lock().unwrap();
    assert!(log.iter().any(|l| l.starts_with("pre_save:TaggedItem:Int(5)")));
}

#[tokio::test]
async fn single_row_escape_skips_the_general_transaction_path() {
    // Exactly one model, one instance, fast-path eligible -> the single-row
    // `UPDATE ... WHERE pk = ?` escape runs instead of the general
    // sort/field-updates machinery.
    let backend = FakeBackend::new(author_book_schema(OnUpdateTag::DoNothing));
    let author = backend.seed(AUTHOR, RowKey::Int(1), vec![]);

    let report = run_update(&backend, vec![author], "id", RowValue::Int(42))
        .await
        .expect("single row escape should succeed");

    assert_eq!(report.total, 1);
    assert_eq!(report.per_label.get("Author"), Some(&1));
    assert!(backend.db.lock().unwrap()[&AUTHOR].contains_key(&RowKey::Int(42)));
}

#[tokio::test]
async fn single_row_escape_marks_for_rollback_on_batch_failure() {
    // Only `try_single_row_escape`'s own error branch calls
    // `mark_for_rollback_on_error` before rolling back; the general
    // `update()` path's error branch does not. Forcing `update_batch` to
    // fail for this single-model, single-row, fast-path-eligible plan and
    // observing that mark is therefore proof the escape actually ran,
    // rather than the general transaction path happening to produce the
    // same counts.
    let backend = FakeBackend::new(author_book_schema(OnUpdateTag::DoNothing))
        .with_failing_update_batch(AUTHOR);
    let author = backend.seed(AUTHOR, RowKey::Int(1), vec![]);

    let err = run_update(&backend, vec![author], "id", RowValue::Int(42))
        .await
        .expect_err("forced update_batch failure should surface");

    assert!(err.to_string().contains("forced update_batch failure"));
    assert!(backend.was_marked_for_rollback());
}

#[tokio::test]
async fn general_path_does_not_mark_for_rollback_on_batch_failure() {
    // Same failure injection, but with two rows collected (so the plan
    // cannot take the single-row escape and falls through to
    // `run_in_txn`'s field_updates drain instead). `run_in_txn`'s error
    // branch rolls back without calling `mark_for_rollback_on_error`,
    // unlike the escape -- this is the contrasting case that shows the
    // two paths really are distinguishable.
    let backend = FakeBackend::new(author_book_schema(OnUpdateTag::DoNothing))
        .with_failing_update_batch(AUTHOR);
    let author1 = backend.seed(AUTHOR, RowKey::Int(1), vec![]);
    let author2 = backend.seed(AUTHOR, RowKey::Int(2), vec![]);

    let err = run_update(&backend, vec![author1, author2], "id", RowValue::Int(42))
        .await
        .expect_err("forced update_batch failure should surface");

    assert!(err.to_string().contains("forced update_batch failure"));
    assert!(!backend.was_marked_for_rollback());
}

#[test]
fn resolve_label_rejects_malformed_and_unregistered_references() {
    let graph = SchemaGraph::new(vec![leaf("library.Author", 0, vec![Field::local("id")])]);

    assert!(graph.resolve_label("Author").is_err());
    assert!(graph.resolve_label("library.").is_err());
    assert!(graph.resolve_label("catalog.Author").is_err());
    assert_eq!(graph.resolve_label("library.Author").ok(), Some(ModelId(0)));
}
