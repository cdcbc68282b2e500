//! Bulk orchestrator: runs every phase of a Joomla → Cyclope migration in the
//! one order that keeps relations behind the entities they point at.
//!
//! users → menus → collections → categories → tags → category tree → articles
//! → categorizations → pictures → article pictures → content fixup → sequences
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::MigrationOptions;
use crate::error::PhaseOrderError;
use crate::migrate::content::{ContentExtractor, PictureRegistry};
use crate::migrate::joomla::{self, LegacyArticle, SourceDuplicates, SYSTEM_ROOT_ID};
use crate::migrate::linker::{link, LinkReport, RelationBuffer};
use crate::migrate::reconcile::{find_collisions, insert_with_reconciliation, slugify, Reconciliation};
use crate::migrate::tree::{IdentitySpace, ParentPointerEncoding, TreeImporter};
use crate::model::{
    AsBatch, Collection, Menu, MenuItem, PendingRelation, Picture, RelationKind, TreeNode, TreeTable, User,
};
use crate::store::{DuplicateQuery, SourceStore, TargetStore};
use crate::util::progress::{Progress, StageTimings};

pub const CATEGORIES_COLLECTION_ID: i64 = 1;
pub const TAGS_COLLECTION_ID: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Users,
    Menus,
    Collections,
    Categories,
    Tags,
    CategoryTree,
    Articles,
    Categorizations,
    Pictures,
    ArticlePictures,
    ContentFixup,
    Sequences,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Users => "users",
            Phase::Menus => "menus",
            Phase::Collections => "collections",
            Phase::Categories => "categories",
            Phase::Tags => "tags",
            Phase::CategoryTree => "category_tree",
            Phase::Articles => "articles",
            Phase::Categorizations => "categorizations",
            Phase::Pictures => "pictures",
            Phase::ArticlePictures => "article_pictures",
            Phase::ContentFixup => "content_fixup",
            Phase::Sequences => "sequences",
        }
    }
}

/// Phases that have committed in this run.
#[derive(Debug, Default, Clone)]
pub struct PhaseLedger {
    committed: HashSet<Phase>,
}

impl PhaseLedger {
    pub fn commit(&mut self, phase: Phase) {
        self.committed.insert(phase);
    }

    pub fn is_committed(&self, phase: Phase) -> bool {
        self.committed.contains(&phase)
    }

    /// Fails on the first of `deps` that has not committed yet.
    pub fn require(&self, step: Phase, deps: &[Phase]) -> Result<(), PhaseOrderError> {
        match deps.iter().find(|d| !self.committed.contains(d)) {
            Some(missing) => Err(PhaseOrderError {
                step: step.label(),
                missing: missing.label(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub duplicates: usize,
    pub slugs_renamed: usize,
    pub names_renamed: usize,
}

/// Outcome of the rich-text pass over article bodies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContentStats {
    pub parsed: usize,
    pub failed: usize,
    pub unresolved_images: usize,
    pub texts_rewritten: usize,
}

impl ContentStats {
    /// Share of scanned bodies that parsed cleanly; 1.0 when nothing was scanned.
    pub fn success_ratio(&self) -> f64 {
        let scanned = self.parsed + self.failed;
        if scanned == 0 {
            1.0
        } else {
            self.parsed as f64 / scanned as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub users: usize,
    pub menus: usize,
    pub menu_items: usize,
    pub dropped_menu_items: usize,
    pub collections: usize,
    pub categories: usize,
    pub tags: usize,
    pub tags_skipped: bool,
    pub articles: usize,
    pub pictures: usize,
    pub relations: LinkReport,
    pub dropped_relations: BTreeMap<RelationKind, usize>,
    pub reconciled: BTreeMap<&'static str, ReconcileStats>,
    pub content: ContentStats,
    pub success_ratio: f64,
    pub stages: StageTimings,
}

impl MigrationReport {
    pub fn dropped(&self, kind: RelationKind) -> usize {
        self.dropped_relations.get(&kind).copied().unwrap_or(0)
    }

    pub fn log_summary(&self) {
        info!(
            users = self.users,
            menus = self.menus,
            menu_items = self.menu_items,
            collections = self.collections,
            categories = self.categories,
            tags = self.tags,
            articles = self.articles,
            pictures = self.pictures,
            "migrated rows"
        );
        for (kind, rows) in &self.relations.linked {
            info!(kind = kind.label(), rows, dropped = self.dropped(*kind), "relations");
        }
        if self.dropped_menu_items > 0 {
            warn!(rows = self.dropped_menu_items, "menu items not migrated");
        }
        for (table, stats) in &self.reconciled {
            info!(
                table,
                duplicates = stats.duplicates,
                slugs_renamed = stats.slugs_renamed,
                names_renamed = stats.names_renamed,
                "duplicates reconciled"
            );
        }
        info!(
            parsed = self.content.parsed,
            failed = self.content.failed,
            unresolved_images = self.content.unresolved_images,
            texts_rewritten = self.content.texts_rewritten,
            success_pct = format!("{:.1}", self.success_ratio * 100.0),
            "article content"
        );
        self.stages.emit_summary();
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("creating report {}", path.display()))?;
        serde_json::to_writer_pretty(file, self).context("writing report json")?;
        info!(path = %path.display(), "report written");
        Ok(())
    }
}

/// One migration run over a source, a target and a content scanner.
pub struct Migration<'a> {
    source: &'a dyn SourceStore,
    target: &'a dyn TargetStore,
    content: &'a dyn ContentExtractor,
    options: MigrationOptions,
    ledger: PhaseLedger,
    stages: StageTimings,
    report: MigrationReport,

    // Ids known to exist in the target, per entity kind
    users: HashSet<i64>,
    categories: IdentitySpace,
    tree_ids: HashSet<i64>,
    tag_offset: Option<i64>,
    articles: HashSet<i64>,

    relations: RelationBuffer,
    pictures: PictureRegistry,
    // (article id, body) of articles that reference at least one picture
    rich_texts: Vec<(i64, String)>,
}

impl<'a> Migration<'a> {
    pub fn new(
        source: &'a dyn SourceStore,
        target: &'a dyn TargetStore,
        content: &'a dyn ContentExtractor,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            target,
            content,
            options,
            ledger: PhaseLedger::default(),
            stages: StageTimings::default(),
            report: MigrationReport::default(),
            users: HashSet::new(),
            categories: IdentitySpace::empty(),
            tree_ids: HashSet::new(),
            tag_offset: None,
            articles: HashSet::new(),
            relations: RelationBuffer::new(),
            pictures: PictureRegistry::starting_at(1),
            rich_texts: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<MigrationReport> {
        let started = Instant::now();
        info!(prefix = self.source.prefix(), "migration started");

        self.profile_stage(Phase::Users, |m| Box::pin(m.import_users())).await?;
        self.profile_stage(Phase::Menus, |m| Box::pin(m.import_menus())).await?;
        self.profile_stage(Phase::Collections, |m| Box::pin(m.create_collections()))
            .await?;
        self.profile_stage(Phase::Categories, |m| Box::pin(m.import_categories()))
            .await?;
        self.profile_stage(Phase::Tags, |m| Box::pin(m.import_tags())).await?;
        self.profile_stage(Phase::CategoryTree, |m| Box::pin(m.rebuild_category_tree()))
            .await?;
        self.profile_stage(Phase::Articles, |m| Box::pin(m.import_articles()))
            .await?;
        self.profile_stage(Phase::Categorizations, |m| Box::pin(m.link_categorizations()))
            .await?;
        self.profile_stage(Phase::Pictures, |m| Box::pin(m.create_pictures()))
            .await?;
        self.profile_stage(Phase::ArticlePictures, |m| Box::pin(m.link_article_pictures()))
            .await?;
        self.profile_stage(Phase::ContentFixup, |m| Box::pin(m.rewrite_contents()))
            .await?;
        self.profile_stage(Phase::Sequences, |m| Box::pin(m.reset_sequences()))
            .await?;

        let mut report = self.report;
        report.success_ratio = report.content.success_ratio();
        report.stages = self.stages;
        info!(took_ms = started.elapsed().as_millis() as u64, "migration finished");
        Ok(report)
    }

    async fn profile_stage<T, F>(&mut self, phase: Phase, func: F) -> Result<T>
    where
        F: for<'m> FnOnce(&'m mut Migration<'a>) -> BoxFuture<'m, Result<T>>,
    {
        let start = Instant::now();
        let result = func(self).await;
        self.stages.record(phase.label(), start.elapsed(), result.is_ok());
        if result.is_ok() {
            self.ledger.commit(phase);
        }
        result.with_context(|| format!("phase {} failed", phase.label()))
    }

    fn record_reconciliation<R>(&mut self, table: &'static str, outcome: &Reconciliation<R>) {
        if outcome.duplicates == 0 {
            return;
        }
        let stats = self.report.reconciled.entry(table).or_default();
        stats.duplicates += outcome.duplicates;
        stats.slugs_renamed += outcome.slugs_renamed;
        stats.names_renamed += outcome.names_renamed;
    }

    fn record_dropped(&mut self, kind: RelationKind, dropped: &[PendingRelation]) {
        if dropped.is_empty() {
            return;
        }
        let sample: Vec<(i64, i64)> = dropped
            .iter()
            .take(5)
            .map(|r| (r.subject_id, r.object_id))
            .collect();
        warn!(
            kind = kind.label(),
            rows = dropped.len(),
            sample = ?sample,
            "relations reference rows that were never migrated; skipped"
        );
        *self.report.dropped_relations.entry(kind).or_default() += dropped.len();
    }

    async fn import_users(&mut self) -> Result<()> {
        let super_users = self
            .source
            .fetch(&joomla::super_users_query())
            .await
            .context("reading super user groups")?
            .iter()
            .map(|r| r.i64("user_id"))
            .collect::<Result<HashSet<_>, _>>()?;
        let rows = self
            .source
            .fetch(&joomla::users_query())
            .await
            .context("reading users")?;
        let default_password = self.options.default_password.as_deref();
        let users = rows
            .iter()
            .map(|r| joomla::user_from_row(r, &super_users, default_password))
            .collect::<Result<Vec<_>, _>>()?;
        if !users.is_empty() {
            self.target
                .bulk_create(User::batch(&users))
                .await
                .context("creating users")?;
        }
        let mut progress = Progress::new("users", Some(users.len()));
        progress.tick(users.len());
        progress.finish();
        self.users = users.iter().map(|u| u.id).collect();
        self.report.users = users.len();
        Ok(())
    }

    async fn import_menus(&mut self) -> Result<()> {
        let rows = self
            .source
            .fetch(&joomla::menu_types_query())
            .await
            .context("reading menu types")?;
        let mut menus: Vec<Menu> = Vec::with_capacity(rows.len());
        let mut menu_ids: HashMap<String, i64> = HashMap::new();
        let mut slugs = HashSet::new();
        for (i, row) in rows.iter().enumerate() {
            let (menutype, mut menu) = joomla::menu_from_row(row, i == 0)?;
            if !slugs.insert(menu.slug.clone()) {
                menu.slug = format!("{}-{}", menu.slug, menu.id);
                slugs.insert(menu.slug.clone());
            }
            menu_ids.insert(menutype, menu.id);
            menus.push(menu);
        }
        if menus.is_empty() {
            info!("no menus in source");
            return Ok(());
        }
        self.target
            .bulk_create(Menu::batch(&menus))
            .await
            .context("creating menus")?;
        self.report.menus = menus.len();

        let rows = self
            .source
            .fetch(&joomla::menu_items_query())
            .await
            .context("reading menu items")?;
        let mut candidates = Vec::with_capacity(rows.len());
        let mut unknown_menu = 0;
        for row in &rows {
            match joomla::menu_item_from_row(row, &menu_ids)? {
                Some(pair) => candidates.push(pair),
                None => unknown_menu += 1,
            }
        }
        let (candidates, orphaned) = joomla::prune_orphans(candidates, SYSTEM_ROOT_ID);
        if unknown_menu + orphaned > 0 {
            warn!(
                unknown_menu,
                orphaned, "menu items skipped: menu not migrated or parent missing"
            );
        }
        self.report.dropped_menu_items = unknown_menu + orphaned;
        if candidates.is_empty() {
            return Ok(());
        }

        let (tree_rows, extras): (Vec<_>, Vec<_>) = candidates.into_iter().unzip();
        // Menu nested sets are often stale after manual reordering; the target
        // rebuilds them from parent pointers.
        let nodes = TreeImporter::new(ParentPointerEncoding)
            .with_root_id(SYSTEM_ROOT_ID)
            .import(&tree_rows, 0)?;
        let items: Vec<MenuItem> = nodes
            .into_iter()
            .zip(extras)
            .map(|(node, extras)| MenuItem {
                node,
                custom_url: extras.custom_url,
                site_home: extras.site_home,
            })
            .collect();
        let lookup = SourceDuplicates::new(self.source, joomla::menu_items_duplicates())
            .with_local(find_collisions(&items));
        let outcome = insert_with_reconciliation(self.target, items, &lookup)
            .await
            .context("creating menu items")?;
        self.record_reconciliation(TreeTable::MenuItems.table(), &outcome);
        self.target
            .rebuild_tree(TreeTable::MenuItems)
            .await
            .context("rebuilding menu tree")?;
        self.report.menu_items = outcome.rows.len();
        info!(rows = outcome.rows.len(), "menu items migrated");
        Ok(())
    }

    async fn create_collections(&mut self) -> Result<()> {
        let categories = collection(CATEGORIES_COLLECTION_ID, &self.options.categories_collection);
        let mut tags = collection(TAGS_COLLECTION_ID, &self.options.tags_collection);
        if tags.slug == categories.slug {
            tags.slug = format!("{}-2", tags.slug);
        }
        for c in [&categories, &tags] {
            self.target
                .create_collection(c)
                .await
                .with_context(|| format!("creating collection {}", c.name))?;
            info!(id = c.id, name = %c.name, slug = %c.slug, "collection created");
        }
        self.report.collections = 2;
        Ok(())
    }

    async fn import_categories(&mut self) -> Result<()> {
        self.ledger.require(Phase::Categories, &[Phase::Collections])?;
        let rows = self
            .source
            .fetch(&joomla::categories_query())
            .await
            .context("reading categories")?;
        let tree_rows = rows
            .iter()
            .map(|r| joomla::tree_row_from(r, CATEGORIES_COLLECTION_ID))
            .collect::<Result<Vec<_>, _>>()?;
        let nodes = TreeImporter::default()
            .with_root_id(SYSTEM_ROOT_ID)
            .import(&tree_rows, 0)?;
        let created = self
            .insert_tree(nodes, joomla::categories_duplicates())
            .await
            .context("creating categories")?;
        self.categories = IdentitySpace::of(&created);
        self.report.categories = created.len();
        info!(rows = created.len(), "categories migrated");
        Ok(())
    }

    async fn import_tags(&mut self) -> Result<()> {
        self.ledger
            .require(Phase::Tags, &[Phase::Collections, Phase::Categories])?;
        if !self.source.has_table(joomla::TAGS).await? {
            warn!(
                table = %format!("{}{}", self.source.prefix(), joomla::TAGS),
                "source has no tags table; tags skipped"
            );
            self.report.tags_skipped = true;
            return Ok(());
        }
        let rows = self
            .source
            .fetch(&joomla::tags_query())
            .await
            .context("reading tags")?;
        let tree_rows = rows
            .iter()
            .map(|r| joomla::tree_row_from(r, TAGS_COLLECTION_ID))
            .collect::<Result<Vec<_>, _>>()?;
        let offset = self.categories.offset();
        let nodes = TreeImporter::default()
            .with_root_id(SYSTEM_ROOT_ID)
            .import(&tree_rows, offset)?;
        let created = self
            .insert_tree(nodes, joomla::tags_duplicates())
            .await
            .context("creating tags")?;
        self.categories = self.categories.extend(&created);
        self.tag_offset = Some(offset);
        self.report.tags = created.len();
        info!(rows = created.len(), offset, "tags migrated");
        Ok(())
    }

    async fn insert_tree(
        &mut self,
        nodes: Vec<TreeNode>,
        duplicates: DuplicateQuery,
    ) -> Result<Vec<TreeNode>> {
        if nodes.is_empty() {
            return Ok(nodes);
        }
        let lookup = SourceDuplicates::new(self.source, duplicates).with_local(find_collisions(&nodes));
        let outcome = insert_with_reconciliation(self.target, nodes, &lookup).await?;
        self.record_reconciliation(TreeTable::Categories.table(), &outcome);
        self.tree_ids.extend(outcome.rows.iter().map(|n| n.id));
        Ok(outcome.rows)
    }

    async fn rebuild_category_tree(&mut self) -> Result<()> {
        self.ledger
            .require(Phase::CategoryTree, &[Phase::Categories, Phase::Tags])?;
        self.target
            .rebuild_tree(TreeTable::Categories)
            .await
            .context("rebuilding category tree")?;
        Ok(())
    }

    async fn import_articles(&mut self) -> Result<()> {
        self.ledger.require(Phase::Articles, &[Phase::Users])?;
        let total = self
            .source
            .count(joomla::CONTENT, None)
            .await
            .context("counting articles")?;
        let (start, limit) = self.options.article_window();
        let available = total.saturating_sub(start);
        let expected = limit.map_or(available, |l| l.min(available));
        let page_size = self.options.page_size.max(1) as u64;
        let mut progress = Progress::new("articles", Some(expected as usize));

        let mut offset = start;
        let mut remaining = limit;
        loop {
            let want = match remaining {
                Some(0) => break,
                Some(r) => r.min(page_size),
                None => page_size,
            };
            let rows = self
                .source
                .fetch(&joomla::articles_query(want, offset))
                .await
                .with_context(|| format!("reading articles at offset {offset}"))?;
            if rows.is_empty() {
                break;
            }
            let fetched = rows.len() as u64;

            let mut batch = Vec::with_capacity(rows.len());
            for row in &rows {
                let legacy = joomla::article_from_row(row, &self.users)?;
                self.scan_article(&legacy);
                batch.push(legacy.article);
            }
            let lookup = SourceDuplicates::new(self.source, joomla::articles_duplicates())
                .with_local(find_collisions(&batch));
            let outcome = insert_with_reconciliation(self.target, batch, &lookup)
                .await
                .with_context(|| format!("creating articles at offset {offset}"))?;
            self.record_reconciliation("articles_article", &outcome);
            self.articles.extend(outcome.rows.iter().map(|a| a.id));
            self.report.articles += outcome.rows.len();
            progress.tick(outcome.rows.len());

            offset += fetched;
            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(fetched);
            }
            if fetched < want {
                break;
            }
        }
        progress.finish();
        Ok(())
    }

    /// Buffers the relations an article carries. A body that does not parse is
    /// counted and its images are skipped; the article itself is kept.
    fn scan_article(&mut self, legacy: &LegacyArticle) {
        let article = &legacy.article;
        if let Some(category) = legacy.category_id {
            self.relations.push(PendingRelation::new(
                RelationKind::Categorization,
                category,
                article.id,
            ));
        }
        let images = match self.content.extract_images(&article.text) {
            Ok(images) => images,
            Err(e) => {
                warn!(article = article.id, error = %e, "article body does not parse; images skipped");
                self.report.content.failed += 1;
                return;
            }
        };
        self.report.content.parsed += 1;
        let mut references_pictures = false;
        for image in &images {
            if !image.is_resolvable() {
                self.report.content.unresolved_images += 1;
                continue;
            }
            let picture = self.pictures.register(image);
            self.relations.push(PendingRelation::new(
                RelationKind::ArticlePicture,
                article.id,
                picture,
            ));
            references_pictures = true;
        }
        if references_pictures {
            self.rich_texts.push((article.id, article.text.clone()));
        }
    }

    async fn link_categorizations(&mut self) -> Result<()> {
        self.ledger.require(
            Phase::Categorizations,
            &[Phase::CategoryTree, Phase::Articles],
        )?;
        if let Some(offset) = self.tag_offset {
            let rows = self
                .source
                .fetch(&joomla::tag_map_query())
                .await
                .context("reading tag map")?;
            for row in &rows {
                let (article, tag) = joomla::tag_link_from_row(row)?;
                self.relations.push(PendingRelation::new(
                    RelationKind::Categorization,
                    tag + offset,
                    article,
                ));
            }
        }

        let pending = std::mem::take(&mut self.relations);
        let (categorizations, rest) = pending.partition(|r| r.kind == RelationKind::Categorization);
        self.relations.extend(rest);
        let (ready, dropped): (Vec<_>, Vec<_>) = categorizations
            .into_iter()
            .partition(|r| self.tree_ids.contains(&r.subject_id) && self.articles.contains(&r.object_id));
        self.record_dropped(RelationKind::Categorization, &dropped);

        let linked = link(self.target, &ready, self.options.link_chunk).await?;
        self.report.relations.merge(linked);
        Ok(())
    }

    async fn create_pictures(&mut self) -> Result<()> {
        self.ledger.require(Phase::Pictures, &[Phase::Articles])?;
        let pictures = self.pictures.pictures();
        if !pictures.is_empty() {
            self.target
                .bulk_create(Picture::batch(pictures))
                .await
                .context("creating pictures")?;
        }
        self.report.pictures = pictures.len();
        info!(rows = pictures.len(), "pictures created");
        Ok(())
    }

    async fn link_article_pictures(&mut self) -> Result<()> {
        self.ledger
            .require(Phase::ArticlePictures, &[Phase::Articles, Phase::Pictures])?;
        let pending = std::mem::take(&mut self.relations);
        let articles = &self.articles;
        let (ready, dropped) = pending.partition(|r| {
            r.kind == RelationKind::ArticlePicture && articles.contains(&r.subject_id)
        });
        self.record_dropped(RelationKind::ArticlePicture, &dropped);

        let linked = link(self.target, &ready, self.options.link_chunk).await?;
        self.report.relations.merge(linked);
        Ok(())
    }

    async fn rewrite_contents(&mut self) -> Result<()> {
        self.ledger
            .require(Phase::ContentFixup, &[Phase::Pictures, Phase::ArticlePictures])?;
        let urls = self.pictures.url_map(&self.options.media_url);
        let mut updates = Vec::new();
        for (id, text) in std::mem::take(&mut self.rich_texts) {
            let (rewritten, replaced) = self.content.rewrite_image_sources(&text, &urls);
            if replaced > 0 {
                updates.push((id, rewritten));
            }
        }
        for chunk in updates.chunks(self.options.page_size.max(1)) {
            self.target
                .update_article_texts(chunk)
                .await
                .context("writing rewritten article texts")?;
        }
        self.report.content.texts_rewritten = updates.len();
        info!(rows = updates.len(), "article image sources rewritten");
        Ok(())
    }

    async fn reset_sequences(&mut self) -> Result<()> {
        self.ledger.require(Phase::Sequences, &[Phase::ContentFixup])?;
        self.target
            .reset_sequences()
            .await
            .context("resetting id sequences")?;
        Ok(())
    }
}

fn collection(id: i64, name: &str) -> Collection {
    let mut slug = slugify(name);
    if slug.is_empty() {
        slug = format!("collection-{id}");
    }
    Collection {
        id,
        name: name.to_string(),
        slug,
        active: true,
    }
}
