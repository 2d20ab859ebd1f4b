//! Property change shaping (spec §4.3): turning a raw property mutation
//! into the diff blob that subscribers see, and the suspend/resume
//! mechanism used around bulk imports.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::storage::StorageAdapter;
use crate::types::{buckets, Granularity, ListMetadata, PropertyValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOperation {
    Put,
    Delete,
    ListAppend,
    ListInsert,
    ListUpdate,
    ListDeleteAt,
    ListExtend,
    ListPop,
    ListClear,
    ListRemoveByValue,
    ListDeleteAll,
    ListMetadataOnly,
}

impl PropertyOperation {
    /// Whether this operation mutates a list rather than a scalar (spec
    /// §4.3).
    pub fn is_list_operation(self) -> bool {
        !matches!(self, PropertyOperation::Put | PropertyOperation::Delete)
    }
}

/// A single property mutation, as observed by whatever owns property
/// storage (out of this engine's scope — spec §1). This is the event the
/// subscription emitter consumes.
#[derive(Debug, Clone, Default)]
pub struct PropertyChange {
    pub target: String,
    pub subtarget: Option<String>,
    /// Set when the change is to one item of a list (spec §4.3's
    /// "resource" addressing); `None` for scalar or whole-list changes.
    pub resource: Option<String>,
    pub operation: PropertyOperation,
    pub data: Option<Value>,
    /// The single item touched by `append`/`insert`/`update`/`remove_by_value`.
    pub item: Option<Value>,
    /// The position touched by `insert`/`update`/`delete_at`.
    pub index: Option<usize>,
    /// The batch of items added by `extend`.
    pub items: Option<Vec<Value>>,
    /// The list's length after the operation is applied, supplied by the
    /// caller (the one component that actually holds the mutated list).
    pub length: Option<usize>,
    /// Carried by `metadata_only` (and optionally alongside other list ops)
    /// to update the list's description/explanation.
    pub list_metadata: Option<ListMetadata>,
}

impl Default for PropertyOperation {
    fn default() -> Self {
        PropertyOperation::Put
    }
}

/// Shape `change` into the JSON blob that goes out in a [`Diff`](crate::types::Diff)
/// or a [`CallbackEnvelope`](crate::wire::CallbackEnvelope), per the
/// granularity table in spec §4.3:
///
/// - `High`  — full data inline.
/// - `Low`   — operation and addressing only, no data (the peer must pull).
/// - `None`  — never reaches here; callers must not emit for `None`
///             subscriptions (the whole point of that granularity is to
///             suppress callbacks entirely).
pub fn build_diff_blob(change: &PropertyChange, granularity: Granularity) -> Value {
    if change.operation.is_list_operation() {
        return build_list_diff_blob(change, granularity);
    }

    let mut blob = json!({
        "target": change.target,
        "operation": change.operation,
    });
    let obj = blob.as_object_mut().expect("object literal");
    if let Some(subtarget) = &change.subtarget {
        obj.insert("subtarget".into(), json!(subtarget));
    }
    if let Some(resource) = &change.resource {
        obj.insert("resource".into(), json!(resource));
    }
    if granularity == Granularity::High {
        if let Some(data) = &change.data {
            obj.insert("data".into(), data.clone());
        }
    }
    blob
}

/// Shape a list mutation into `{list, operation, item?, index?, items?,
/// length?}` (spec §4.3): addressing (`index`/`length`) is always present,
/// the item payload (`item`/`items`) only for `High` granularity.
fn build_list_diff_blob(change: &PropertyChange, granularity: Granularity) -> Value {
    let mut blob = json!({
        "list": list_name(change),
        "operation": change.operation,
    });
    let obj = blob.as_object_mut().expect("object literal");
    if let Some(index) = change.index {
        obj.insert("index".into(), json!(index));
    }
    if let Some(length) = change.length {
        obj.insert("length".into(), json!(length));
    }
    if granularity == Granularity::High {
        if let Some(item) = &change.item {
            obj.insert("item".into(), item.clone());
        }
        if let Some(items) = &change.items {
            obj.insert("items".into(), json!(items));
        }
    }
    blob
}

fn list_name(change: &PropertyChange) -> String {
    change
        .resource
        .clone()
        .or_else(|| change.subtarget.clone())
        .unwrap_or_else(|| change.target.clone())
}

/// Diff-suppression flag for an actor, keyed by target (spec §4.3: a bulk
/// import suspends diff emission, then triggers a resync on resume rather
/// than replaying every individual change).
pub async fn is_suspended(storage: &dyn StorageAdapter, actor_id: &str, target: &str) -> Result<bool> {
    Ok(storage
        .get_attr(actor_id, buckets::SUSPENSIONS, target)
        .await?
        .map(|attr| attr.data.as_bool().unwrap_or(false))
        .unwrap_or(false))
}

pub async fn suspend(storage: &dyn StorageAdapter, actor_id: &str, target: &str) -> Result<()> {
    storage
        .set_attr(actor_id, buckets::SUSPENSIONS, target, json!(true))
        .await
}

/// Clear the suspension flag. Callers are responsible for triggering a
/// resync of affected subscriptions afterward (spec §4.3) — this function
/// only lifts the flag.
pub async fn resume(storage: &dyn StorageAdapter, actor_id: &str, target: &str) -> Result<()> {
    storage.delete_attr(actor_id, buckets::SUSPENSIONS, target).await
}

/// Mirror an inbound change into the `remote:<peer_id>` attribute bucket
/// (spec §4.6's auto-storage), so the rest of the local app can read the
/// peer's published state without re-fetching it. Scalars and lists are
/// stored as [`PropertyValue`], enforcing the spec §3 invariant that a name
/// is either scalar or list, never both.
pub async fn mirror_remote_change(
    storage: &dyn StorageAdapter,
    actor_id: &str,
    peer_id: &str,
    change: &PropertyChange,
) -> Result<()> {
    let bucket = buckets::remote_mirror(peer_id);
    let name = mirror_key(change);

    match change.operation {
        PropertyOperation::Delete => storage.delete_attr(actor_id, &bucket, &name).await,
        PropertyOperation::Put => {
            let value = PropertyValue::Scalar {
                value: change.data.clone().unwrap_or(Value::Null),
            };
            store_value(storage, actor_id, &bucket, &name, &value).await
        }
        PropertyOperation::ListDeleteAll => storage.delete_attr(actor_id, &bucket, &name).await,
        op if op.is_list_operation() => {
            let mut list = load_list(storage, actor_id, &bucket, &name).await?;
            apply_list_operation(&mut list, op, change);
            store_value(storage, actor_id, &bucket, &name, &PropertyValue::List {
                items: list.0,
                metadata: list.1,
            })
            .await
        }
        _ => unreachable!("Put/Delete handled above"),
    }
}

/// `(items, metadata)` pair read back out of a stored [`PropertyValue`];
/// anything else stored under the name (including a scalar) is treated as
/// an empty list to mirror into.
async fn load_list(
    storage: &dyn StorageAdapter,
    actor_id: &str,
    bucket: &str,
    name: &str,
) -> Result<(Vec<Value>, ListMetadata)> {
    match storage.get_attr(actor_id, bucket, name).await? {
        Some(attr) => match serde_json::from_value::<PropertyValue>(attr.data) {
            Ok(PropertyValue::List { items, metadata }) => Ok((items, metadata)),
            _ => Ok((Vec::new(), ListMetadata::default())),
        },
        None => Ok((Vec::new(), ListMetadata::default())),
    }
}

fn apply_list_operation(list: &mut (Vec<Value>, ListMetadata), op: PropertyOperation, change: &PropertyChange) {
    let (items, metadata) = list;
    match op {
        PropertyOperation::ListAppend => {
            if let Some(item) = &change.item {
                items.push(item.clone());
            }
        }
        PropertyOperation::ListInsert => {
            if let Some(item) = &change.item {
                let index = change.index.unwrap_or(items.len()).min(items.len());
                items.insert(index, item.clone());
            }
        }
        PropertyOperation::ListUpdate => {
            if let (Some(item), Some(index)) = (&change.item, change.index) {
                if index < items.len() {
                    items[index] = item.clone();
                }
            }
        }
        PropertyOperation::ListDeleteAt => {
            if let Some(index) = change.index {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        PropertyOperation::ListExtend => {
            if let Some(extra) = &change.items {
                items.extend(extra.iter().cloned());
            }
        }
        PropertyOperation::ListPop => {
            items.pop();
        }
        PropertyOperation::ListClear => {
            items.clear();
        }
        PropertyOperation::ListRemoveByValue => {
            if let Some(item) = &change.item {
                if let Some(pos) = items.iter().position(|v| v == item) {
                    items.remove(pos);
                }
            }
        }
        PropertyOperation::ListMetadataOnly | PropertyOperation::ListDeleteAll => {}
        PropertyOperation::Put | PropertyOperation::Delete => unreachable!("not a list operation"),
    }
    if let Some(new_metadata) = &change.list_metadata {
        *metadata = new_metadata.clone();
    }
}

async fn store_value(
    storage: &dyn StorageAdapter,
    actor_id: &str,
    bucket: &str,
    name: &str,
    value: &PropertyValue,
) -> Result<()> {
    let data = serde_json::to_value(value).unwrap_or(Value::Null);
    storage.set_attr(actor_id, bucket, name, data).await
}

fn mirror_key(change: &PropertyChange) -> String {
    let mut key = change.target.clone();
    if let Some(subtarget) = &change.subtarget {
        key.push('/');
        key.push_str(subtarget);
    }
    if let Some(resource) = &change.resource {
        key.push('/');
        key.push_str(resource);
    }
    key
}
