use std::path::PathBuf;

use anyhow::Result;
use category_tree_core::{Category, CategoryId, CategoryTreeManager, NewCategory, TreeError};
use category_tree_store_sqlite::{SchemaStatus, SqliteCategoryStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const ADDED_MESSAGE: &str = "Category was successfully added.";
pub const LISTED_MESSAGE: &str = "Categories found.";
pub const FOUND_MESSAGE: &str = "Success.";
pub const FIRST_DESCENDANTS_MESSAGE: &str = "Category and first descendant found.";
pub const ALL_DESCENDANTS_MESSAGE: &str = "Category and all descendants found.";
pub const REMOVED_MESSAGE: &str = "Category was successfully removed";
pub const MOVED_MESSAGE: &str = "Subtree successfully moved.";

const SUCCESS_STATUS: u16 = 200;

/// Uniform success payload returned by every category operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub status_code: u16,
    pub message: String,
    pub error: Option<String>,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    fn ok(message: &str, data: Option<T>) -> Self {
        Self { status_code: SUCCESS_STATUS, message: message.to_string(), error: None, data }
    }
}

/// Body of a create call. `parentId` is accepted as an alias of `parent_id`;
/// any other key is rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AddCategoryRequest {
    pub name: String,
    #[serde(default, alias = "parentId")]
    pub parent_id: Option<CategoryId>,
}

impl From<AddCategoryRequest> for NewCategory {
    fn from(request: AddCategoryRequest) -> Self {
        NewCategory { name: request.name, parent_id: request.parent_id }
    }
}

#[derive(Debug, Clone)]
pub struct CategoryTreeApi {
    db_path: PathBuf,
}

impl CategoryTreeApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteCategoryStore> {
        let mut store = SqliteCategoryStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn open_manager(&self) -> Result<CategoryTreeManager<SqliteCategoryStore>, TreeError> {
        self.open_store().map(CategoryTreeManager::new).map_err(|err| {
            let detail = format!("{err:#}");
            tracing::error!(db = %self.db_path.display(), error = %detail, "failed to open category store");
            TreeError::Internal(format!("Category store is unavailable: {detail}"))
        })
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteCategoryStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Create a category, optionally under an existing parent.
    ///
    /// # Errors
    /// `BadRequest` for a blank name or malformed parent id, `NotFound` for a
    /// missing parent, `Conflict` for a duplicate name.
    pub fn add_category(&self, request: AddCategoryRequest) -> Result<Envelope<Category>, TreeError> {
        let mut manager = self.open_manager()?;
        let category = manager.add_category(request.into())?;
        Ok(Envelope::ok(ADDED_MESSAGE, Some(category)))
    }

    /// Every root category with its descendants nested under it.
    ///
    /// # Errors
    /// `NotFound` when the table is empty.
    pub fn get_all_categories(&self) -> Result<Envelope<Vec<Category>>, TreeError> {
        let manager = self.open_manager()?;
        let forest = manager.get_all_categories()?;
        Ok(Envelope::ok(LISTED_MESSAGE, Some(forest)))
    }

    /// # Errors
    /// `BadRequest` for a malformed id, `NotFound` when absent.
    pub fn get_category_by_id(&self, id: &str) -> Result<Envelope<Category>, TreeError> {
        let manager = self.open_manager()?;
        let category = manager.get_category_by_id(id)?;
        Ok(Envelope::ok(FOUND_MESSAGE, Some(category)))
    }

    /// # Errors
    /// `BadRequest` for a malformed id, `NotFound` when absent.
    pub fn get_category_and_first_descendants_by_id(
        &self,
        id: &str,
    ) -> Result<Envelope<Category>, TreeError> {
        let manager = self.open_manager()?;
        let category = manager.get_category_and_first_descendants_by_id(id)?;
        Ok(Envelope::ok(FIRST_DESCENDANTS_MESSAGE, Some(category)))
    }

    /// # Errors
    /// `BadRequest` for a malformed id, `NotFound` when absent.
    pub fn get_category_and_all_descendants_by_id(
        &self,
        id: &str,
    ) -> Result<Envelope<Category>, TreeError> {
        let manager = self.open_manager()?;
        let category = manager.get_category_and_all_descendants_by_id(id)?;
        Ok(Envelope::ok(ALL_DESCENDANTS_MESSAGE, Some(category)))
    }

    /// Delete a category together with its whole subtree.
    ///
    /// # Errors
    /// `BadRequest` for a malformed id, `NotFound` when absent, `Internal` when
    /// the cascade fails part-way (nothing is deleted in that case).
    pub fn remove_category_by_id(&self, id: &str) -> Result<Envelope<()>, TreeError> {
        let mut manager = self.open_manager()?;
        manager.remove_category_by_id(id)?;
        Ok(Envelope::ok(REMOVED_MESSAGE, None))
    }

    /// Re-parent `source_id` under `destination_parent_id`.
    ///
    /// # Errors
    /// `BadRequest` for malformed ids or a move into the source's own subtree,
    /// `NotFound` when either category is absent.
    pub fn move_subtree(
        &self,
        source_id: &str,
        destination_parent_id: &str,
    ) -> Result<Envelope<Category>, TreeError> {
        let mut manager = self.open_manager()?;
        let moved = manager.move_subtree(source_id, destination_parent_id)?;
        Ok(Envelope::ok(MOVED_MESSAGE, Some(moved)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use category_tree_core::{ErrorKind, CYCLIC_MOVE_MESSAGE, DUPLICATE_NAME_MESSAGE};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("category-tree-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn add(api: &CategoryTreeApi, name: &str, parent_id: Option<i64>) -> Category {
        let envelope = match api.add_category(AddCategoryRequest {
            name: name.to_string(),
            parent_id: parent_id.map(CategoryId),
        }) {
            Ok(envelope) => envelope,
            Err(err) => panic!("failed to add {name}: {err}"),
        };
        match envelope.data {
            Some(category) => category,
            None => panic!("add envelope for {name} carried no data"),
        }
    }

    fn expect_err<T: std::fmt::Debug>(result: Result<T, TreeError>) -> TreeError {
        match result {
            Ok(value) => panic!("expected an error, got {value:?}"),
            Err(err) => err,
        }
    }

    #[test]
    fn add_returns_envelope_with_parent_attached() {
        let api = CategoryTreeApi::new(unique_temp_db_path());
        let root = add(&api, "Electronics", None);

        let envelope = api
            .add_category(AddCategoryRequest {
                name: "Laptops".to_string(),
                parent_id: Some(root.id),
            })
            .unwrap_or_else(|err| panic!("failed to add child: {err}"));

        assert_eq!(envelope.status_code, 200);
        assert_eq!(envelope.message, ADDED_MESSAGE);
        assert_eq!(envelope.error, None);
        let child = envelope.data.unwrap_or_else(|| panic!("missing data"));
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(child.parent.map(|parent| parent.name), Some("Electronics".to_string()));
    }

    #[test]
    fn add_request_accepts_camel_case_parent_and_rejects_unknown_keys() {
        let request: AddCategoryRequest =
            serde_json::from_str(r#"{"name":"Laptops","parentId":1}"#)
                .unwrap_or_else(|err| panic!("camelCase body should parse: {err}"));
        assert_eq!(request.parent_id, Some(CategoryId(1)));

        let misspelled =
            serde_json::from_str::<AddCategoryRequest>(r#"{"name":"Laptops","parent":1}"#);
        assert!(misspelled.is_err());
    }

    #[test]
    fn envelope_serializes_with_null_error_and_data() {
        let api = CategoryTreeApi::new(unique_temp_db_path());
        let root = add(&api, "Books", None);

        let envelope = api
            .remove_category_by_id(&root.id.to_string())
            .unwrap_or_else(|err| panic!("failed to remove: {err}"));
        let value = serde_json::to_value(&envelope)
            .unwrap_or_else(|err| panic!("failed to serialize envelope: {err}"));

        assert_eq!(value["status_code"], 200);
        assert_eq!(value["message"], REMOVED_MESSAGE);
        assert!(value["error"].is_null());
        assert!(value["data"].is_null());
    }

    #[test]
    fn reads_use_operation_specific_messages() {
        let api = CategoryTreeApi::new(unique_temp_db_path());
        let root = add(&api, "Electronics", None);
        let laptops = add(&api, "Laptops", Some(root.id.0));
        add(&api, "Gaming Laptops", Some(laptops.id.0));
        let id = root.id.to_string();

        let listed = api
            .get_all_categories()
            .unwrap_or_else(|err| panic!("failed to list: {err}"));
        assert_eq!(listed.message, LISTED_MESSAGE);
        assert_eq!(listed.data.map(|forest| forest.len()), Some(1));

        let single = api
            .get_category_by_id(&id)
            .unwrap_or_else(|err| panic!("failed to get: {err}"));
        assert_eq!(single.message, FOUND_MESSAGE);
        assert_eq!(single.data.map(|category| category.children.is_none()), Some(true));

        let first = api
            .get_category_and_first_descendants_by_id(&id)
            .unwrap_or_else(|err| panic!("failed to get first level: {err}"));
        assert_eq!(first.message, FIRST_DESCENDANTS_MESSAGE);
        let first = first.data.unwrap_or_else(|| panic!("missing data"));
        let children = first.children.unwrap_or_default();
        assert_eq!(children.len(), 1);
        assert!(children[0].children.is_none());

        let all = api
            .get_category_and_all_descendants_by_id(&id)
            .unwrap_or_else(|err| panic!("failed to get subtree: {err}"));
        assert_eq!(all.message, ALL_DESCENDANTS_MESSAGE);
        let all = all.data.unwrap_or_else(|| panic!("missing data"));
        let grandchildren = all
            .children
            .unwrap_or_default()
            .into_iter()
            .flat_map(|child| child.children.unwrap_or_default())
            .map(|grandchild| grandchild.name)
            .collect::<Vec<_>>();
        assert_eq!(grandchildren, vec!["Gaming Laptops".to_string()]);
    }

    #[test]
    fn errors_keep_their_kind_through_the_api() {
        let api = CategoryTreeApi::new(unique_temp_db_path());

        let empty = expect_err(api.get_all_categories());
        assert_eq!(empty.kind(), ErrorKind::NotFound);

        let malformed = expect_err(api.get_category_by_id("abc"));
        assert_eq!(malformed.kind(), ErrorKind::BadRequest);

        let missing = expect_err(api.get_category_by_id("999"));
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        add(&api, "Electronics", None);
        let duplicate = expect_err(api.add_category(AddCategoryRequest {
            name: "Electronics".to_string(),
            parent_id: None,
        }));
        assert_eq!(duplicate.kind(), ErrorKind::Conflict);
        assert_eq!(duplicate.message(), DUPLICATE_NAME_MESSAGE);
    }

    #[test]
    fn move_subtree_rejects_cycles_and_reports_success() {
        let api = CategoryTreeApi::new(unique_temp_db_path());
        let electronics = add(&api, "Electronics", None);
        let laptops = add(&api, "Laptops", Some(electronics.id.0));
        let phones = add(&api, "Phones", Some(electronics.id.0));

        let cycle = expect_err(
            api.move_subtree(&electronics.id.to_string(), &laptops.id.to_string()),
        );
        assert_eq!(cycle.kind(), ErrorKind::BadRequest);
        assert_eq!(cycle.message(), CYCLIC_MOVE_MESSAGE);

        let moved = api
            .move_subtree(&phones.id.to_string(), &laptops.id.to_string())
            .unwrap_or_else(|err| panic!("failed to move: {err}"));
        assert_eq!(moved.message, MOVED_MESSAGE);
        let moved = moved.data.unwrap_or_else(|| panic!("missing data"));
        assert_eq!(moved.parent_id, Some(laptops.id));
        assert_eq!(moved.parent.map(|parent| parent.id), Some(laptops.id));
    }

    #[test]
    fn remove_cascades_and_persists_across_calls() {
        let db_path = unique_temp_db_path();
        let api = CategoryTreeApi::new(db_path.clone());
        let electronics = add(&api, "Electronics", None);
        add(&api, "Laptops", Some(electronics.id.0));
        let books = add(&api, "Books", None);

        api.remove_category_by_id(&electronics.id.to_string())
            .unwrap_or_else(|err| panic!("failed to remove: {err}"));

        let reopened = CategoryTreeApi::new(db_path);
        let forest = reopened
            .get_all_categories()
            .unwrap_or_else(|err| panic!("failed to list: {err}"))
            .data
            .unwrap_or_default();
        assert_eq!(forest.iter().map(|category| category.id).collect::<Vec<_>>(), vec![books.id]);
    }

    #[test]
    fn schema_status_reports_no_pending_versions_after_first_call() -> Result<()> {
        let api = CategoryTreeApi::new(unique_temp_db_path());
        add(&api, "Electronics", None);

        let status = api.schema_status()?;
        assert!(status.pending_versions.is_empty());
        assert_eq!(status.current_version, status.target_version);
        Ok(())
    }
}
