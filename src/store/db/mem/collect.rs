use std::{cmp::Ordering, sync::RwLock};

use serde_json::Value as JsonValue;

use crate::{
    OrchflowError, Result,
    store::{DbCollection, PageData, query::Query},
};

use super::DbDocument;

/// Insertion-ordered in-memory collection.
#[derive(Debug)]
pub struct Collect<T> {
    name: String,
    items: RwLock<Vec<T>>,
}

impl<T> Collect<T> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: RwLock::new(Vec::new()),
        }
    }

    fn poisoned(&self) -> OrchflowError {
        OrchflowError::Store(format!("collection {} is poisoned", self.name))
    }
}

impl<T: DbDocument> DbCollection for Collect<T> {
    type Item = T;

    fn exists(
        &self,
        id: &str,
    ) -> Result<bool> {
        let items = self.items.read().map_err(|_| self.poisoned())?;
        Ok(items.iter().any(|item| item.id() == id))
    }

    fn find(
        &self,
        id: &str,
    ) -> Result<Self::Item> {
        let items = self.items.read().map_err(|_| self.poisoned())?;
        items.iter().find(|item| item.id() == id).cloned().ok_or_else(|| OrchflowError::Store(format!("{} record {} not found", self.name, id)))
    }

    fn query(
        &self,
        q: &Query,
    ) -> Result<PageData<Self::Item>> {
        let items = self.items.read().map_err(|_| self.poisoned())?;
        let mut rows: Vec<(JsonDoc, &T)> = items
            .iter()
            .map(|item| (item.doc(), item))
            .filter(|(doc, _)| q.filters().iter().all(|(key, value)| doc.get(key) == Some(value)))
            .collect();

        for (key, rev) in q.order_by().iter().rev() {
            rows.sort_by(|(a, _), (b, _)| {
                let ord = compare(a.get(key), b.get(key));
                if *rev { ord.reverse() } else { ord }
            });
        }

        let count = rows.len();
        let limit = q.limit().max(1);
        Ok(PageData {
            count,
            page_num: q.offset() / limit + 1,
            page_count: count.div_ceil(limit),
            page_size: limit,
            rows: rows.into_iter().skip(q.offset()).take(limit).map(|(_, item)| item.clone()).collect(),
        })
    }

    fn create(
        &self,
        data: &Self::Item,
    ) -> Result<bool> {
        let mut items = self.items.write().map_err(|_| self.poisoned())?;
        if items.iter().any(|item| item.id() == data.id()) {
            return Err(OrchflowError::Store(format!("{} record {} already exists", self.name, data.id())));
        }
        items.push(data.clone());
        Ok(true)
    }

    fn update(
        &self,
        data: &Self::Item,
    ) -> Result<bool> {
        let mut items = self.items.write().map_err(|_| self.poisoned())?;
        match items.iter_mut().find(|item| item.id() == data.id()) {
            Some(item) => {
                *item = data.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(
        &self,
        id: &str,
    ) -> Result<bool> {
        let mut items = self.items.write().map_err(|_| self.poisoned())?;
        let before = items.len();
        items.retain(|item| item.id() != id);
        Ok(items.len() != before)
    }
}

type JsonDoc = std::collections::HashMap<String, JsonValue>;

fn compare(
    a: Option<&JsonValue>,
    b: Option<&JsonValue>,
) -> Ordering {
    match (a, b) {
        (Some(JsonValue::Number(a)), Some(JsonValue::Number(b))) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
        (Some(JsonValue::String(a)), Some(JsonValue::String(b))) => a.cmp(b),
        (Some(JsonValue::Bool(a)), Some(JsonValue::Bool(b))) => a.cmp(b),
        (None | Some(JsonValue::Null), None | Some(JsonValue::Null)) => Ordering::Equal,
        (None | Some(JsonValue::Null), _) => Ordering::Less,
        (_, None | Some(JsonValue::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
