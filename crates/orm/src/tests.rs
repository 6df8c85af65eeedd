//! End-to-end tests for finding entities by criteria
//!
//! Runs the unit of work against the in-memory executor seeded by
//! [`fixtures::seeded_store`].

use std::sync::Arc;

use serde_json::json;

use crate::backends::InMemoryExecutor;
use crate::entity::Entity;
use crate::identity::TaggedId;
use crate::query::Criteria;
use crate::unit_of_work::UnitOfWork;
use crate::value::DatabaseValue;


use fixtures::{author_row, book_row, metadata, seeded_store, text};

fn unit_of_work(store: InMemoryExecutor) -> UnitOfWork {
    UnitOfWork::new(metadata(), Arc::new(store))
}

fn values(entities: &[Entity], field: &str) -> Vec<DatabaseValue> {
    entities.iter().map(|e| e.get(field).unwrap()).collect()
}

#[tokio::test]
async fn test_find_all() {
    let uow = unit_of_work(seeded_store());
    let authors = uow.find("Author", &Criteria::new()).await.unwrap();
    assert_eq!(values(&authors, "firstName"), vec![text("a1"), text("a2")]);
}

#[tokio::test]
async fn test_find_by_simple_varchar() {
    let uow = unit_of_work(seeded_store());
    let authors = uow.find_json("Author", &json!({"firstName": "a2"})).await.unwrap();
    assert_eq!(values(&authors, "firstName"), vec![text("a2")]);
}

#[tokio::test]
async fn test_find_by_varchar_through_join() {
    let uow = unit_of_work(seeded_store());
    let books = uow
        .find_json("Book", &json!({"author": {"firstName": "a2"}}))
        .await
        .unwrap();
    assert_eq!(values(&books, "title"), vec![text("b2"), text("b3")]);
}

#[tokio::test]
async fn test_find_by_varchar_through_two_joins() {
    let uow = unit_of_work(seeded_store());
    let books = uow
        .find_json("Book", &json!({"author": {"publisher": {"name": "p2"}}}))
        .await
        .unwrap();
    assert_eq!(values(&books, "title"), vec![text("b2"), text("b3")]);
}

#[tokio::test]
async fn test_find_by_foreign_key() {
    let uow = unit_of_work(seeded_store());
    let a1 = uow.load("Author", "1").await.unwrap();
    let books = uow.find("Book", &Criteria::new().entity("author", &a1)).await.unwrap();
    assert_eq!(values(&books, "title"), vec![text("b1")]);
}

#[tokio::test]
async fn test_find_books_by_publisher() {
    let uow = unit_of_work(seeded_store());
    let publisher = uow.load("Publisher", "1").await.unwrap();
    let criteria = Criteria::new().nested("author", Criteria::new().entity("publisher", &publisher));
    let books = uow.find("Book", &criteria).await.unwrap();
    assert_eq!(values(&books, "title"), vec![text("b1")]);
}

#[tokio::test]
async fn test_find_by_foreign_key_using_only_an_id() {
    let store = InMemoryExecutor::new();
    store.insert_rows(
        "authors",
        vec![author_row(3, "a1", 30, None), author_row(4, "a2", 40, None)],
    );
    store.insert_rows("books", vec![book_row(1, "b1", 3), book_row(2, "b2", 4)]);
    let uow = unit_of_work(store);

    let books = uow.find_json("Book", &json!({"author": {"id": "4"}})).await.unwrap();
    assert_eq!(values(&books, "title"), vec![text("b2")]);

    let books = uow
        .find("Book", &Criteria::new().id("author", TaggedId::new("a", "3")))
        .await
        .unwrap();
    assert_eq!(values(&books, "title"), vec![text("b1")]);
}

#[tokio::test]
async fn test_find_by_enum() {
    let uow = unit_of_work(seeded_store());
    let publishers = uow.find_json("Publisher", &json!({"size": "LARGE"})).await.unwrap();
    assert_eq!(values(&publishers, "name"), vec![text("p2")]);
    assert_eq!(publishers[0].get("size").unwrap(), DatabaseValue::Int64(2));
}

#[tokio::test]
async fn test_find_by_integer_and_comparisons() {
    let uow = unit_of_work(seeded_store());
    let exact = uow.find_json("Author", &json!({"age": 2})).await.unwrap();
    assert_eq!(values(&exact, "firstName"), vec![text("a2")]);

    let greater = uow.find_json("Author", &json!({"age": {"$gt": 1}})).await.unwrap();
    assert_eq!(values(&greater, "firstName"), vec![text("a2")]);

    let at_least = uow.find_json("Author", &json!({"age": {"$gte": 1}})).await.unwrap();
    assert_eq!(at_least.len(), 2);

    let below = uow.find_json("Author", &json!({"age": {"$lt": 2}})).await.unwrap();
    assert_eq!(values(&below, "firstName"), vec![text("a1")]);
}

#[tokio::test]
async fn test_find_through_collections() {
    let uow = unit_of_work(seeded_store());
    let authors = uow
        .find_json("Author", &json!({"books": {"title": {"$gte": "b2"}}}))
        .await
        .unwrap();
    // a2 has two matching books but appears once
    assert_eq!(values(&authors, "firstName"), vec![text("a2")]);

    let books = uow.find_json("Book", &json!({"tags": {"name": "t2"}})).await.unwrap();
    assert_eq!(values(&books, "title"), vec![text("b2")]);
}

#[tokio::test]
async fn test_unsupported_criteria_runs_no_query() {
    let store = Arc::new(seeded_store());
    let uow = UnitOfWork::new(metadata(), store.clone());
    let result = uow.find_json("Author", &json!({"age": {"$foo": 1}})).await;
    assert!(matches!(result, Err(crate::error::OrmError::UnsupportedCriteria(_))));
    assert_eq!(store.query_count(), 0);
}
