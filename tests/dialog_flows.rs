//! End-to-end dialog journeys against a real in-memory store.

use std::sync::Arc;

use barter_bot::dialog::{DialogEngine, Event, Reply, ReplyKind};
use barter_bot::store::{LibSqlBackend, Store};

async fn fixture() -> (Arc<LibSqlBackend>, DialogEngine) {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let engine = DialogEngine::new(store.clone() as Arc<dyn Store>);
    (store, engine)
}

fn texts(replies: &[Reply]) -> Vec<String> {
    replies
        .iter()
        .filter_map(|r| match &r.kind {
            ReplyKind::Text(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

fn captions(replies: &[Reply]) -> Vec<String> {
    replies
        .iter()
        .filter_map(|r| match &r.kind {
            ReplyKind::Photo { caption, .. } => Some(caption.clone()),
            _ => None,
        })
        .collect()
}

async fn text(engine: &DialogEngine, user: &str, t: &str) -> Vec<Reply> {
    engine.handle_event(user, Event::Text(t.to_string())).await
}

async fn button(engine: &DialogEngine, user: &str, tag: &str) -> Vec<Reply> {
    engine
        .handle_event(user, Event::Button(tag.to_string()))
        .await
}

async fn photo(engine: &DialogEngine, user: &str, photo_ref: &str) -> Vec<Reply> {
    engine
        .handle_event(user, Event::Photo(photo_ref.to_string()))
        .await
}

/// Walk a user from first contact through profile creation and an item
/// upload.
async fn onboard(engine: &DialogEngine, user: &str, name: &str, contact: &str) {
    text(engine, user, "/start").await;
    text(engine, user, "Create Profile").await;
    text(engine, user, name).await;
    text(engine, user, contact).await;
}

async fn upload(engine: &DialogEngine, user: &str, name: &str, category: &str, wanted: &str) {
    text(engine, user, "Upload New Item").await;
    photo(engine, user, &format!("{user}_item.jpg")).await;
    text(engine, user, name).await;
    text(engine, user, category).await;
    text(engine, user, "well loved but solid").await;
    text(engine, user, wanted).await;
}

#[tokio::test]
async fn full_journey_from_start_to_uploaded_item() {
    let (store, engine) = fixture().await;

    let replies = text(&engine, "100", "/start").await;
    assert!(texts(&replies)[0].contains("Welcome"));

    onboard(&engine, "100", "Alice", "@alice").await;
    upload(&engine, "100", "Football boots", "football", "Tennis racket").await;

    let items = store.list_items_by_owner("100").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "Football boots");
    assert_eq!(items[0].contact, "@alice");

    // The rendered item card carries all the item details.
    let replies = text(&engine, "100", "My Items").await;
    let caption = &captions(&replies)[0];
    assert!(caption.contains("Football boots"));
    assert!(caption.contains("football"));
    assert!(caption.contains("Tennis racket"));
    assert!(caption.contains("@alice"));
}

#[tokio::test]
async fn two_users_search_and_match_each_other() {
    let (_store, engine) = fixture().await;

    onboard(&engine, "100", "Alice", "@alice").await;
    onboard(&engine, "200", "Bob", "@bob").await;
    upload(&engine, "100", "Football boots", "football", "Tennis racket").await;
    upload(&engine, "200", "Tennis racket", "tennis", "Football boots").await;

    // Bob searches for what others want in return and finds Alice's item.
    text(&engine, "200", "Search Barter Items").await;
    button(&engine, "200", "kind:wanted").await;
    let replies = text(&engine, "200", "tennis racket").await;
    assert!(captions(&replies)[0].contains("Football boots"));

    let replies = button(&engine, "200", "match").await;
    assert!(texts(&replies)[0].contains("@alice"));

    // Alice searches by item name and matches Bob's racket.
    text(&engine, "100", "Search Barter Items").await;
    button(&engine, "100", "kind:name").await;
    let replies = text(&engine, "100", "racket").await;
    assert!(captions(&replies)[0].contains("Tennis racket"));

    let replies = button(&engine, "100", "match").await;
    assert!(texts(&replies)[0].contains("@bob"));
}

#[tokio::test]
async fn matching_does_not_remove_the_item() {
    let (store, engine) = fixture().await;

    onboard(&engine, "100", "Alice", "@alice").await;
    onboard(&engine, "200", "Bob", "@bob").await;
    onboard(&engine, "300", "Cara", "@cara").await;
    upload(&engine, "100", "Gym gloves", "gym", "anything").await;

    for user in ["200", "300"] {
        text(&engine, user, "Search Barter Items").await;
        button(&engine, user, "kind:name").await;
        text(&engine, user, "gloves").await;
        let replies = button(&engine, user, "match").await;
        assert!(texts(&replies)[0].contains("@alice"));
    }

    assert_eq!(store.list_items().await.unwrap().len(), 1);
}

#[tokio::test]
async fn interleaved_flows_stay_isolated_per_user() {
    let (store, engine) = fixture().await;

    onboard(&engine, "100", "Alice", "@alice").await;
    onboard(&engine, "200", "Bob", "@bob").await;

    // Alice is mid-upload while Bob walks the edit flow; neither session
    // bleeds into the other.
    text(&engine, "100", "Upload New Item").await;
    photo(&engine, "100", "alice_item.jpg").await;
    text(&engine, "100", "Chess set").await;

    upload(&engine, "200", "Dumbbells", "gym", "kettlebell").await;
    text(&engine, "200", "My Items").await;
    button(&engine, "200", "edit:0").await;
    button(&engine, "200", "field:name").await;

    text(&engine, "100", "boardgames").await;
    text(&engine, "200", "Barbell").await;
    text(&engine, "100", "complete, no missing pieces").await;
    text(&engine, "100", "Backgammon board").await;

    let alice_items = store.list_items_by_owner("100").await.unwrap();
    assert_eq!(alice_items[0].name, "Chess set");
    assert_eq!(alice_items[0].category, "boardgames");

    let bob_items = store.list_items_by_owner("200").await.unwrap();
    assert_eq!(bob_items[0].name, "Barbell");
    assert_eq!(bob_items[0].category, "gym");
}

#[tokio::test]
async fn list_buttons_track_items_not_positions() {
    let (store, engine) = fixture().await;

    onboard(&engine, "100", "Alice", "@alice").await;
    upload(&engine, "100", "First", "misc", "x").await;
    upload(&engine, "100", "Second", "misc", "y").await;
    upload(&engine, "100", "Third", "misc", "z").await;

    let ids: Vec<i64> = store
        .list_items_by_owner("100")
        .await
        .unwrap()
        .iter()
        .map(|i| i.id)
        .collect();

    text(&engine, "100", "My Items").await;

    // The first item vanishes after the list was rendered; the button
    // bound to position 2 must still act on "Third".
    store.delete_item(ids[0], "100").await.unwrap();
    button(&engine, "100", "edit:2").await;
    button(&engine, "100", "field:name").await;
    text(&engine, "100", "Third, renamed").await;

    let names: Vec<String> = store
        .list_items_by_owner("100")
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names, vec!["Second", "Third, renamed"]);
}

#[tokio::test]
async fn wrong_event_kind_reports_and_preserves_flow() {
    let (store, engine) = fixture().await;

    onboard(&engine, "100", "Alice", "@alice").await;
    text(&engine, "100", "Upload New Item").await;

    // A text where a photo is expected is rejected without resetting the
    // flow, and the flow then completes normally.
    let replies = text(&engine, "100", "not a photo").await;
    assert!(texts(&replies)[0].contains("expecting a photo"));

    photo(&engine, "100", "alice_item.jpg").await;
    text(&engine, "100", "Kite").await;
    text(&engine, "100", "outdoors").await;
    text(&engine, "100", "flies fine").await;
    let replies = text(&engine, "100", "frisbee").await;
    assert!(texts(&replies)[0].contains("uploaded"));

    assert_eq!(store.list_items_by_owner("100").await.unwrap().len(), 1);
}

#[tokio::test]
async fn search_browse_passes_through_full_result_set() {
    let (_store, engine) = fixture().await;

    onboard(&engine, "100", "Alice", "@alice").await;
    upload(&engine, "100", "Tennis ball", "tennis", "x").await;
    upload(&engine, "100", "Tennis net", "tennis", "y").await;
    upload(&engine, "100", "Gym mat", "gym", "z").await;

    text(&engine, "100", "Search Barter Items").await;
    button(&engine, "100", "kind:common").await;
    let replies = text(&engine, "100", "tennis").await;
    assert!(captions(&replies)[0].contains("Tennis ball"));

    let replies = button(&engine, "100", "pass").await;
    assert!(captions(&replies)[0].contains("Tennis net"));

    let replies = button(&engine, "100", "pass").await;
    assert!(texts(&replies)[0].contains("all the items"));
}
