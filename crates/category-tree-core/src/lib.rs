use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const CYCLIC_MOVE_MESSAGE: &str =
    "Invalid category structure. Cannot move node to its descendant.";
pub const DUPLICATE_NAME_MESSAGE: &str = "Category name must be unique.";
pub const INVALID_ID_MESSAGE: &str = "Invalid category ID format.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CategoryId(pub i64);

impl CategoryId {
    /// Store-generated identifiers are strictly positive.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl Display for CategoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid category id `{raw}`: expected a positive integer")]
pub struct ParseCategoryIdError {
    raw: String,
}

impl FromStr for CategoryId {
    type Err = ParseCategoryIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = value
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseCategoryIdError { raw: value.to_string() })?;
        let id = Self(parsed);
        if !id.is_valid() {
            return Err(ParseCategoryIdError { raw: value.to_string() });
        }
        Ok(id)
    }
}

/// Conversion from caller-supplied identifiers (path segments, JSON numbers,
/// typed ids) into a validated [`CategoryId`].
pub trait IntoCategoryId {
    /// # Errors
    /// Returns [`TreeError::BadRequest`] when the value is not a positive integer.
    fn into_category_id(self) -> Result<CategoryId, TreeError>;
}

impl IntoCategoryId for CategoryId {
    fn into_category_id(self) -> Result<CategoryId, TreeError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(TreeError::BadRequest(format!("{INVALID_ID_MESSAGE} ({})", self.0)))
        }
    }
}

impl IntoCategoryId for i64 {
    fn into_category_id(self) -> Result<CategoryId, TreeError> {
        CategoryId(self).into_category_id()
    }
}

impl IntoCategoryId for &str {
    fn into_category_id(self) -> Result<CategoryId, TreeError> {
        self.parse::<CategoryId>().map_err(TreeError::from)
    }
}

impl IntoCategoryId for String {
    fn into_category_id(self) -> Result<CategoryId, TreeError> {
        self.as_str().into_category_id()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::BadRequest => "bad_request",
            Self::Internal => "internal",
        }
    }

    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::BadRequest => 400,
            Self::Internal => 500,
        }
    }
}

/// Classified failure of a tree operation. Raw store errors never escape the
/// manager; they are always mapped onto one of these kinds first.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TreeError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl TreeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(message)
            | Self::Conflict(message)
            | Self::BadRequest(message)
            | Self::Internal(message) => message,
        }
    }
}

impl From<ParseCategoryIdError> for TreeError {
    fn from(err: ParseCategoryIdError) -> Self {
        Self::BadRequest(format!("{INVALID_ID_MESSAGE} ({err})"))
    }
}

/// Distinguishable failure signals reported by a [`CategoryStore`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),
    #[error("tree shape violated: {0}")]
    TreeShapeViolation(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub parent_id: Option<CategoryId>,
    /// Materialized parent; only populated on the results of add and move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Category>>,
    /// `None` when children were not loaded, `Some(vec![])` for a loaded leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Category>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Category {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Drop any materialized relations, keeping only the stored columns.
    #[must_use]
    pub fn detached(mut self) -> Self {
        self.parent = None;
        self.children = None;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewCategory {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<CategoryId>,
}

/// Row written through [`CategoryStore::save`]: inserted when `id` is `None`,
/// updated otherwise.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SaveCategory {
    pub id: Option<CategoryId>,
    pub name: String,
    pub parent_id: Option<CategoryId>,
}

/// Persistence Port consumed by [`CategoryTreeManager`].
///
/// Implementations enforce name uniqueness, referential integrity of
/// `parent_id`, and any forest-shape rules of their own, reporting each as a
/// distinct [`StoreError`] variant.
pub trait CategoryStore {
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no row has this id.
    fn find_by_id(&self, id: CategoryId) -> Result<Category, StoreError>;

    /// Every root, with `children` populated down to the leaves.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when rows cannot be read.
    fn find_all_as_forest(&self) -> Result<Vec<Category>, StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when rows cannot be read.
    fn find_children_of(&self, parent_id: CategoryId) -> Result<Vec<Category>, StoreError>;

    /// # Errors
    /// Returns a constraint [`StoreError`] when the row violates uniqueness,
    /// referential integrity, or tree shape.
    fn save(&mut self, category: SaveCategory) -> Result<Category, StoreError>;

    /// # Errors
    /// Returns [`StoreError::ForeignKeyViolation`] when other rows still
    /// reference `id` as their parent.
    fn delete(&mut self, id: CategoryId) -> Result<(), StoreError>;

    /// Open a unit of work. Stores without transactions keep the default.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the unit cannot be opened.
    fn begin_unit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// # Errors
    /// Returns a [`StoreError`] when the unit cannot be committed.
    fn commit_unit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// # Errors
    /// Returns a [`StoreError`] when the unit cannot be rolled back.
    fn rollback_unit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Build nested trees out of flat rows. Rows keep their input order among
/// siblings; rows that are not reachable from a root are dropped.
#[must_use]
pub fn assemble_forest(rows: Vec<Category>) -> Vec<Category> {
    let mut by_parent: BTreeMap<Option<CategoryId>, Vec<Category>> = BTreeMap::new();
    for row in rows {
        by_parent.entry(row.parent_id).or_default().push(row.detached());
    }

    let roots = by_parent.remove(&None).unwrap_or_default();
    let mut visited = BTreeSet::new();
    let mut forest = Vec::with_capacity(roots.len());
    for root in roots {
        if visited.insert(root.id) {
            let tree = build_tree(root, &mut visited, |id| {
                Ok::<_, Infallible>(by_parent.remove(&Some(id)).unwrap_or_default())
            });
            match tree {
                Ok(tree) => forest.push(tree),
                Err(never) => match never {},
            }
        }
    }
    forest
}

/// Materialize the subtree under `root` with an explicit work list; call depth
/// stays constant however deep the tree is. Children whose id is already in
/// `visited` are skipped; loaded leaves end up with `Some(vec![])`.
fn build_tree<E>(
    mut root: Category,
    visited: &mut BTreeSet<CategoryId>,
    mut children_of: impl FnMut(CategoryId) -> Result<Vec<Category>, E>,
) -> Result<Category, E> {
    // Every node is stored after its parent; `None` means the parent is `root`.
    let mut nodes: Vec<(Category, Option<usize>)> = Vec::new();
    for child in children_of(root.id)? {
        if visited.insert(child.id) {
            nodes.push((child.detached(), None));
        }
    }
    let mut cursor = 0;
    while let Some(id) = nodes.get(cursor).map(|(node, _)| node.id) {
        for child in children_of(id)? {
            if visited.insert(child.id) {
                nodes.push((child.detached(), Some(cursor)));
            }
        }
        cursor += 1;
    }

    // Draining from the back completes each subtree before it is attached.
    // Siblings arrive last-first and are put back in order once complete.
    while let Some((mut node, parent)) = nodes.pop() {
        node.children.get_or_insert_with(Vec::new).reverse();
        let slot = match parent {
            Some(index) => nodes.get_mut(index).map(|(parent, _)| parent),
            None => Some(&mut root),
        };
        if let Some(parent) = slot {
            parent.children.get_or_insert_with(Vec::new).push(node);
        }
    }
    root.children.get_or_insert_with(Vec::new).reverse();
    Ok(root)
}

/// Per-operation wording used when classifying store failures.
struct ErrorContext {
    not_found: String,
    referenced: &'static str,
    internal: &'static str,
}

impl ErrorContext {
    fn lookup(id: CategoryId) -> Self {
        Self {
            not_found: format!("Category with ID {id} not found."),
            referenced: "Bad Request",
            internal: "An unexpected error occurred.",
        }
    }
}

fn classify(err: StoreError, context: &ErrorContext) -> TreeError {
    match err {
        StoreError::NotFound(_) => TreeError::NotFound(context.not_found.clone()),
        StoreError::UniqueViolation(_) => TreeError::Conflict(DUPLICATE_NAME_MESSAGE.to_string()),
        StoreError::ForeignKeyViolation(detail) => {
            TreeError::BadRequest(format!("{}: {detail}", context.referenced))
        }
        StoreError::TreeShapeViolation(detail) => {
            TreeError::BadRequest(format!("Invalid category structure: {detail}"))
        }
        StoreError::InvalidIdentifier(detail) => {
            TreeError::BadRequest(format!("{INVALID_ID_MESSAGE} ({detail})"))
        }
        StoreError::Backend(detail) => TreeError::Internal(format!("{} {detail}", context.internal)),
    }
}

/// Depth-first, pre-order walk over `find_children_of`. Ids already seen are
/// skipped, so irregular data cannot make the walk loop.
fn descendants_in<S>(store: &S, root: &Category) -> Result<Vec<Category>, StoreError>
where
    S: CategoryStore + ?Sized,
{
    let mut visited = BTreeSet::from([root.id]);
    let mut descendants = Vec::new();
    let mut stack = Vec::new();
    push_unvisited_children(store, root.id, &mut visited, &mut stack)?;

    while let Some(node) = stack.pop() {
        let id = node.id;
        descendants.push(node);
        push_unvisited_children(store, id, &mut visited, &mut stack)?;
    }

    Ok(descendants)
}

fn push_unvisited_children<S>(
    store: &S,
    parent_id: CategoryId,
    visited: &mut BTreeSet<CategoryId>,
    stack: &mut Vec<Category>,
) -> Result<(), StoreError>
where
    S: CategoryStore + ?Sized,
{
    let children = store.find_children_of(parent_id)?;
    // Reversed so the first child is popped first.
    for child in children.into_iter().rev() {
        if visited.insert(child.id) {
            stack.push(child.detached());
        }
    }
    Ok(())
}

/// Owns every tree invariant on top of a [`CategoryStore`].
#[derive(Debug)]
pub struct CategoryTreeManager<S> {
    store: S,
}

impl<S> CategoryTreeManager<S>
where
    S: CategoryStore,
{
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Insert a category, optionally attached to an existing parent.
    ///
    /// # Errors
    /// [`TreeError::NotFound`] for a missing parent, [`TreeError::Conflict`]
    /// for a duplicate name, [`TreeError::BadRequest`] for blank names,
    /// malformed parent ids, or structural store violations, and
    /// [`TreeError::Internal`] for anything else.
    pub fn add_category(&mut self, input: NewCategory) -> Result<Category, TreeError> {
        if input.name.trim().is_empty() {
            return Err(TreeError::BadRequest("Category name MUST be provided.".to_string()));
        }
        let parent_id = input.parent_id.map(IntoCategoryId::into_category_id).transpose()?;

        let context = ErrorContext {
            not_found: match parent_id {
                Some(id) => format!("Parent category with ID {id} not found."),
                None => "Parent category not found.".to_string(),
            },
            referenced: "Bad Request",
            internal: "Error during category addition.",
        };

        let saved = self.in_unit(&context, |store| {
            let parent = match parent_id {
                Some(id) => Some(store.find_by_id(id).map_err(|err| classify(err, &context))?),
                None => None,
            };
            let mut saved = store
                .save(SaveCategory { id: None, name: input.name, parent_id })
                .map_err(|err| classify(err, &context))?;
            saved.parent = parent.map(|parent| Box::new(parent.detached()));
            Ok(saved)
        })?;

        tracing::info!(
            category_id = %saved.id,
            parent_id = ?saved.parent_id,
            root = saved.is_root(),
            "category added"
        );
        Ok(saved)
    }

    /// Every root with its full subtree.
    ///
    /// # Errors
    /// [`TreeError::NotFound`] when the store holds no categories, otherwise
    /// the classified store failure.
    pub fn get_all_categories(&self) -> Result<Vec<Category>, TreeError> {
        let context = ErrorContext {
            not_found: "Category not found.".to_string(),
            referenced: "Bad Request",
            internal: "An error occurred while listing categories.",
        };
        let forest = self.store.find_all_as_forest().map_err(|err| classify(err, &context))?;
        if forest.is_empty() {
            return Err(TreeError::NotFound("No categories found.".to_string()));
        }
        tracing::debug!(roots = forest.len(), "category forest loaded");
        Ok(forest)
    }

    /// The category alone, without parent or children.
    ///
    /// # Errors
    /// [`TreeError::BadRequest`] for a malformed id, [`TreeError::NotFound`]
    /// when absent.
    pub fn get_category_by_id(&self, id: impl IntoCategoryId) -> Result<Category, TreeError> {
        let id = id.into_category_id()?;
        let category = self.lookup(id)?;
        tracing::debug!(category_id = %id, "category loaded");
        Ok(category)
    }

    /// The category with its immediate children; grandchildren are not loaded.
    ///
    /// # Errors
    /// Same as [`Self::get_category_by_id`].
    pub fn get_category_and_first_descendants_by_id(
        &self,
        id: impl IntoCategoryId,
    ) -> Result<Category, TreeError> {
        let id = id.into_category_id()?;
        let context = ErrorContext::lookup(id);
        let mut category = self.lookup(id)?;
        let children = self.store.find_children_of(id).map_err(|err| classify(err, &context))?;
        category.children = Some(children.into_iter().map(Category::detached).collect());
        tracing::debug!(category_id = %id, "category and first descendants loaded");
        Ok(category)
    }

    /// The category with its whole subtree materialized.
    ///
    /// # Errors
    /// Same as [`Self::get_category_by_id`].
    pub fn get_category_and_all_descendants_by_id(
        &self,
        id: impl IntoCategoryId,
    ) -> Result<Category, TreeError> {
        let id = id.into_category_id()?;
        let context = ErrorContext::lookup(id);
        let category = self.lookup(id)?;
        let mut visited = BTreeSet::from([id]);
        let tree = build_tree(category, &mut visited, |parent_id| {
            self.store.find_children_of(parent_id)
        })
        .map_err(|err| classify(err, &context))?;
        tracing::debug!(category_id = %id, "category and all descendants loaded");
        Ok(tree)
    }

    /// Delete the category and every descendant, deepest first.
    ///
    /// # Errors
    /// [`TreeError::NotFound`] when absent, [`TreeError::BadRequest`] for a
    /// malformed id or when the store still sees references to a deleted row.
    pub fn remove_category_by_id(&mut self, id: impl IntoCategoryId) -> Result<(), TreeError> {
        let id = id.into_category_id()?;
        let context = ErrorContext {
            not_found: format!("Category with ID {id} not found."),
            referenced: "Cannot remove category with referenced descendants",
            internal: "Internal server error during category removal.",
        };

        let removed = self.in_unit(&context, |store| {
            let category = store.find_by_id(id).map_err(|err| classify(err, &context))?;
            let descendants =
                descendants_in(&*store, &category).map_err(|err| classify(err, &context))?;
            // Pre-order reversed puts every node after its whole subtree.
            for descendant in descendants.iter().rev() {
                store.delete(descendant.id).map_err(|err| classify(err, &context))?;
            }
            store.delete(category.id).map_err(|err| classify(err, &context))?;
            Ok(descendants.len() + 1)
        })?;

        tracing::info!(category_id = %id, removed, "category subtree removed");
        Ok(())
    }

    /// Re-parent `source_id` (with its subtree) under `destination_parent_id`.
    ///
    /// # Errors
    /// [`TreeError::NotFound`] when either side is missing,
    /// [`TreeError::BadRequest`] when the destination is the source or one of
    /// its descendants, or on store referential violations.
    pub fn move_subtree(
        &mut self,
        source_id: impl IntoCategoryId,
        destination_parent_id: impl IntoCategoryId,
    ) -> Result<Category, TreeError> {
        let source_id = source_id.into_category_id()?;
        let destination_id = destination_parent_id.into_category_id()?;
        let context = ErrorContext {
            not_found: "Source category or destination parent not found.".to_string(),
            referenced: "Cannot move subtree with referenced categories",
            internal: "Internal server error during subtree movement.",
        };

        let moved = self.in_unit(&context, |store| {
            let source = store.find_by_id(source_id).map_err(|err| classify(err, &context))?;
            let destination =
                store.find_by_id(destination_id).map_err(|err| classify(err, &context))?;

            if source.id == destination.id {
                return Err(TreeError::BadRequest(CYCLIC_MOVE_MESSAGE.to_string()));
            }
            let descendants =
                descendants_in(&*store, &source).map_err(|err| classify(err, &context))?;
            if descendants.iter().any(|descendant| descendant.id == destination.id) {
                return Err(TreeError::BadRequest(CYCLIC_MOVE_MESSAGE.to_string()));
            }

            let mut moved = store
                .save(SaveCategory {
                    id: Some(source.id),
                    name: source.name,
                    parent_id: Some(destination.id),
                })
                .map_err(|err| classify(err, &context))?;
            moved.parent = Some(Box::new(destination.detached()));
            Ok(moved)
        })?;

        tracing::info!(
            category_id = %source_id,
            parent_id = %destination_id,
            "category subtree moved"
        );
        Ok(moved)
    }

    /// Every descendant of `category` in depth-first pre-order.
    ///
    /// # Errors
    /// Returns the classified store failure.
    pub fn collect_descendants(&self, category: &Category) -> Result<Vec<Category>, TreeError> {
        descendants_in(&self.store, category)
            .map_err(|err| classify(err, &ErrorContext::lookup(category.id)))
    }

    fn lookup(&self, id: CategoryId) -> Result<Category, TreeError> {
        self.store
            .find_by_id(id)
            .map(Category::detached)
            .map_err(|err| classify(err, &ErrorContext::lookup(id)))
    }

    /// Run `body` inside a store unit of work: committed on `Ok`, rolled back
    /// on every `Err`.
    fn in_unit<T>(
        &mut self,
        context: &ErrorContext,
        body: impl FnOnce(&mut S) -> Result<T, TreeError>,
    ) -> Result<T, TreeError> {
        self.store.begin_unit().map_err(|err| classify(err, context))?;

        let outcome = match body(&mut self.store) {
            Ok(value) => {
                self.store.commit_unit().map(|()| value).map_err(|err| classify(err, context))
            }
            Err(err) => Err(err),
        };

        if outcome.is_err() {
            if let Err(err) = self.store.rollback_unit() {
                tracing::error!(error = %err, "failed to roll back category unit of work");
            }
        }
        outcome
    }
}
