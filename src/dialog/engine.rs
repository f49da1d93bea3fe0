//! Dialog engine — applies inbound events to per-user dialog sessions.
//!
//! One session per user, created lazily on the first event. The session
//! map lock is held only to fetch the user's session handle; the event
//! itself is applied under that session's own lock. Two events for the
//! same user never interleave mid-handling, while other users' dialogs
//! proceed concurrently. Positional buttons on rendered lists are
//! resolved through the bindings captured at render time, never by
//! re-deriving "the i-th item" at click time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::channels::{InlineButton, Keyboard};
use crate::dialog::state::DialogState;
use crate::error::StoreError;
use crate::model::{ItemField, NewItem, Profile};
use crate::search::{QueryKind, SearchSession};
use crate::store::Store;

// ── Menu labels (reply keyboard) ────────────────────────────────────

pub const MENU_CREATE_PROFILE: &str = "Create Profile";
pub const MENU_MY_PROFILE: &str = "My Profile";
pub const MENU_MY_ITEMS: &str = "My Items";
pub const MENU_SEARCH: &str = "Search Barter Items";
pub const MENU_UPLOAD: &str = "Upload New Item";

// ── Button tags ─────────────────────────────────────────────────────

const TAG_EDIT_PREFIX: &str = "edit:";
const TAG_DELETE_PREFIX: &str = "delete:";
const TAG_FIELD_PREFIX: &str = "field:";
const TAG_KIND_PREFIX: &str = "kind:";
const TAG_PASS: &str = "pass";
const TAG_MATCH: &str = "match";

/// An inbound event after transport decoding. Photo payloads have already
/// been persisted and reduced to an opaque `photo_ref`.
#[derive(Debug, Clone)]
pub enum Event {
    Text(String),
    Photo(String),
    Button(String),
}

impl Event {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Photo(_) => "photo",
            Self::Button(_) => "button",
        }
    }
}

/// What an outbound reply renders as. `photo_ref` resolution to bytes is
/// the caller's job; the engine only deals in opaque refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    Text(String),
    Photo { photo_ref: String, caption: String },
    EditCaption(String),
    DeleteMessage,
}

/// One outbound render request emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub keyboard: Option<Keyboard>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Text(text.into()),
            keyboard: None,
        }
    }

    pub fn text_with(text: impl Into<String>, keyboard: Keyboard) -> Self {
        Self {
            kind: ReplyKind::Text(text.into()),
            keyboard: Some(keyboard),
        }
    }

    pub fn photo(photo_ref: &str, caption: &str, keyboard: Option<Keyboard>) -> Self {
        Self {
            kind: ReplyKind::Photo {
                photo_ref: photo_ref.to_string(),
                caption: caption.to_string(),
            },
            keyboard,
        }
    }

    pub fn edit_caption(caption: impl Into<String>, keyboard: Option<Keyboard>) -> Self {
        Self {
            kind: ReplyKind::EditCaption(caption.into()),
            keyboard,
        }
    }

    pub fn delete_message() -> Self {
        Self {
            kind: ReplyKind::DeleteMessage,
            keyboard: None,
        }
    }
}

/// Per-user dialog session. Owned exclusively by its user; never shared.
#[derive(Default)]
struct Session {
    state: DialogState,
    /// Last rendered positional list: position -> stable item id.
    bindings: Vec<i64>,
    search: Option<SearchSession>,
}

/// The dialog engine: session map plus the store it mutates.
pub struct DialogEngine {
    store: Arc<dyn Store>,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl DialogEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one inbound event to the user's session and return the
    /// outbound replies. Creates the session on first contact. Only this
    /// user's session is locked while the event runs; concurrent events
    /// for other users are not serialized against it.
    pub async fn handle_event(&self, user_id: &str, event: Event) -> Vec<Reply> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(sessions.entry(user_id.to_string()).or_default())
        };
        let mut session = session.lock().await;

        let state = std::mem::take(&mut session.state);
        debug!(user_id, flow = %state, event = event.kind_name(), "Applying event");

        let (next, replies) = self.step(user_id, &mut session, state, event).await;
        session.state = next;
        replies
    }

    /// Current dialog state for a user (`Idle` if no session exists yet).
    pub async fn current_state(&self, user_id: &str) -> DialogState {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(user_id).map(Arc::clone)
        };
        match session {
            Some(session) => session.lock().await.state.clone(),
            None => DialogState::default(),
        }
    }

    // ── Transition table ────────────────────────────────────────────

    async fn step(
        &self,
        user_id: &str,
        session: &mut Session,
        state: DialogState,
        event: Event,
    ) -> (DialogState, Vec<Reply>) {
        match (state, event) {
            // ── Idle: menu entries and list buttons ─────────────────
            (DialogState::Idle, Event::Text(text)) => match text.trim() {
                "/start" => self.start_command(user_id).await,
                MENU_CREATE_PROFILE => (
                    DialogState::ProfileName,
                    vec![Reply::text_with("👤 What is your name?", Keyboard::Remove)],
                ),
                MENU_MY_PROFILE => (DialogState::Idle, self.show_profile(user_id).await),
                MENU_MY_ITEMS => (DialogState::Idle, self.render_my_items(user_id, session).await),
                MENU_UPLOAD => (
                    DialogState::UploadPhoto,
                    vec![Reply::text_with(
                        "📸 Send a photo of the item you'd like to trade:",
                        Keyboard::Remove,
                    )],
                ),
                MENU_SEARCH => (
                    DialogState::SearchKind,
                    vec![Reply::text_with(
                        "🔍 What would you like to search by?",
                        kind_keyboard(),
                    )],
                ),
                _ => (
                    DialogState::Idle,
                    vec![Reply::text_with(
                        "🤔 I didn't catch that. Pick an option from the menu.",
                        main_menu(),
                    )],
                ),
            },

            (DialogState::Idle, Event::Button(tag)) => {
                if let Some(pos) = tag.strip_prefix(TAG_EDIT_PREFIX) {
                    self.begin_edit(user_id, session, pos).await
                } else if let Some(pos) = tag.strip_prefix(TAG_DELETE_PREFIX) {
                    (DialogState::Idle, self.delete_at(user_id, session, pos).await)
                } else {
                    (
                        DialogState::Idle,
                        vec![Reply::text("⚠️ That button isn't active any more.")],
                    )
                }
            }

            // ── Profile creation ────────────────────────────────────
            (DialogState::ProfileName, Event::Text(name)) => (
                DialogState::ProfileContact {
                    name: name.trim().to_string(),
                },
                vec![Reply::text(
                    "📞 Now enter your contact (phone, username, etc):",
                )],
            ),

            (DialogState::ProfileContact { name }, Event::Text(contact)) => {
                let profile = Profile::new(user_id, &name, contact.trim());
                match self.store.upsert_profile(&profile).await {
                    Ok(()) => (
                        DialogState::Idle,
                        vec![
                            Reply::text("✅ Profile created successfully!"),
                            menu_reply(),
                        ],
                    ),
                    Err(err) => (
                        DialogState::ProfileContact { name },
                        vec![failure_reply("upsert_profile", &err)],
                    ),
                }
            }

            // ── Item upload ─────────────────────────────────────────
            (DialogState::UploadPhoto, Event::Photo(photo_ref)) => (
                DialogState::UploadName { photo_ref },
                vec![Reply::text("📛 What is the name of the item?")],
            ),

            (DialogState::UploadName { photo_ref }, Event::Text(name)) => (
                DialogState::UploadCategory {
                    photo_ref,
                    name: name.trim().to_string(),
                },
                vec![Reply::text(
                    "🏷 What category is it in? (e.g. football, gym, tennis)",
                )],
            ),

            (DialogState::UploadCategory { photo_ref, name }, Event::Text(category)) => (
                DialogState::UploadDescription {
                    photo_ref,
                    name,
                    category: category.trim().to_string(),
                },
                vec![Reply::text("📝 Add a short description:")],
            ),

            (
                DialogState::UploadDescription {
                    photo_ref,
                    name,
                    category,
                },
                Event::Text(description),
            ) => (
                DialogState::UploadWanted {
                    photo_ref,
                    name,
                    category,
                    description: description.trim().to_string(),
                },
                vec![Reply::text("🔄 What item are you looking for in return?")],
            ),

            (
                DialogState::UploadWanted {
                    photo_ref,
                    name,
                    category,
                    description,
                },
                Event::Text(wanted),
            ) => {
                let draft = NewItem {
                    owner_id: user_id.to_string(),
                    photo_ref: photo_ref.clone(),
                    name: name.clone(),
                    category: category.clone(),
                    description: description.clone(),
                    wanted: wanted.trim().to_string(),
                };
                match self.store.insert_item(draft).await {
                    Ok(id) => {
                        debug!(user_id, item_id = id, "Item uploaded");
                        (
                            DialogState::Idle,
                            vec![
                                Reply::text("✅ Your item has been uploaded!"),
                                menu_reply(),
                            ],
                        )
                    }
                    Err(StoreError::ProfileNotFound { .. }) => (
                        DialogState::Idle,
                        vec![Reply::text_with(
                            "❌ You must create a profile first.",
                            create_profile_keyboard(),
                        )],
                    ),
                    Err(err) => (
                        DialogState::UploadWanted {
                            photo_ref,
                            name,
                            category,
                            description,
                        },
                        vec![failure_reply("insert_item", &err)],
                    ),
                }
            }

            // ── Item edit ───────────────────────────────────────────
            (DialogState::EditField { item_id }, Event::Button(tag)) => {
                match tag.strip_prefix(TAG_FIELD_PREFIX).map(ItemField::parse) {
                    Some(Ok(field)) => (
                        DialogState::EditValue { item_id, field },
                        vec![Reply::edit_caption(
                            format!("✏️ Send the new value for {}:", field.label()),
                            None,
                        )],
                    ),
                    Some(Err(err)) => {
                        warn!(user_id, error = %err, "Unknown edit field tag");
                        (
                            DialogState::EditField { item_id },
                            vec![Reply::text("⚠️ Unknown field selected.")],
                        )
                    }
                    None => (
                        DialogState::EditField { item_id },
                        vec![Reply::text("⚠️ Pick one of the field buttons.")],
                    ),
                }
            }

            (DialogState::EditValue { item_id, field }, Event::Text(value)) => {
                match self
                    .store
                    .update_item_field(item_id, field, value.trim(), user_id)
                    .await
                {
                    Ok(()) => (
                        DialogState::Idle,
                        vec![
                            Reply::text(format!(
                                "✏️ {} updated to: {}",
                                field.label(),
                                value.trim()
                            )),
                            menu_reply(),
                        ],
                    ),
                    Err(StoreError::ItemNotFound { .. }) => (
                        DialogState::Idle,
                        vec![Reply::text("⚠️ That item is no longer available.")],
                    ),
                    Err(StoreError::NotOwner { .. }) => (
                        DialogState::Idle,
                        vec![Reply::text("⚠️ You can only edit your own items.")],
                    ),
                    Err(err) => (
                        DialogState::EditValue { item_id, field },
                        vec![failure_reply("update_item_field", &err)],
                    ),
                }
            }

            // ── Search ──────────────────────────────────────────────
            (DialogState::SearchKind, Event::Button(tag)) => {
                match tag.strip_prefix(TAG_KIND_PREFIX).and_then(QueryKind::parse) {
                    Some(kind) => (
                        DialogState::SearchQuery { kind },
                        vec![Reply::text("🔑 Send a keyword to search for:")],
                    ),
                    None => (
                        DialogState::SearchKind,
                        vec![Reply::text("⚠️ Pick one of the search options.")],
                    ),
                }
            }

            (DialogState::SearchQuery { kind }, Event::Text(keyword)) => {
                let keyword = keyword.trim().to_string();
                if keyword.is_empty() {
                    return (
                        DialogState::SearchQuery { kind },
                        vec![Reply::text(
                            "⚠️ The search keyword can't be empty. Try again:",
                        )],
                    );
                }
                self.run_query(session, kind, &keyword).await
            }

            (DialogState::SearchBrowse, Event::Button(tag)) => match tag.as_str() {
                TAG_PASS => {
                    if let Some(search) = session.search.as_mut() {
                        search.advance();
                    }
                    self.render_search_current(session).await
                }
                TAG_MATCH => self.confirm_match(session).await,
                _ => (
                    DialogState::SearchBrowse,
                    vec![Reply::text("⚠️ Use the Match or Pass buttons.")],
                ),
            },

            // ── Anything else: event kind mismatch ──────────────────
            (state, event) => {
                warn!(
                    user_id,
                    flow = %state,
                    event = event.kind_name(),
                    "Event kind mismatch; state unchanged"
                );
                let reply = Reply::text(format!(
                    "⚠️ I was expecting {} here. Let's pick up where we left off.",
                    state.expects()
                ));
                (state, vec![reply])
            }
        }
    }

    // ── Flow helpers ────────────────────────────────────────────────

    async fn start_command(&self, user_id: &str) -> (DialogState, Vec<Reply>) {
        match self.store.get_profile(user_id).await {
            Ok(Some(_)) => (DialogState::Idle, vec![menu_reply()]),
            Ok(None) => (
                DialogState::Idle,
                vec![Reply::text_with(
                    "👋 Welcome to Barter Bot!\nYou need to create a profile to continue.",
                    create_profile_keyboard(),
                )],
            ),
            Err(err) => (DialogState::Idle, vec![failure_reply("get_profile", &err)]),
        }
    }

    async fn show_profile(&self, user_id: &str) -> Vec<Reply> {
        match self.store.get_profile(user_id).await {
            Ok(Some(profile)) => vec![Reply::text(format!(
                "👤 *Your Profile:*\n\n🧑 Name: {}\n📞 Contact: {}",
                profile.display_name, profile.contact
            ))],
            Ok(None) => vec![Reply::text_with(
                "❌ No profile found.",
                create_profile_keyboard(),
            )],
            Err(err) => vec![failure_reply("get_profile", &err)],
        }
    }

    /// Render the user's items, one photo message each with Edit/Delete
    /// buttons, and rebind the positional lookup table for this render.
    async fn render_my_items(&self, user_id: &str, session: &mut Session) -> Vec<Reply> {
        let items = match self.store.list_items_by_owner(user_id).await {
            Ok(items) => items,
            Err(err) => return vec![failure_reply("list_items_by_owner", &err)],
        };

        if items.is_empty() {
            return vec![Reply::text("🧺 You haven't uploaded any items yet.")];
        }

        session.bindings = items.iter().map(|item| item.id).collect();

        items
            .iter()
            .enumerate()
            .map(|(pos, item)| {
                Reply::photo(&item.photo_ref, &item.caption(), Some(item_buttons(pos)))
            })
            .collect()
    }

    /// Resolve a positional edit button and enter the edit flow.
    async fn begin_edit(
        &self,
        user_id: &str,
        session: &mut Session,
        pos: &str,
    ) -> (DialogState, Vec<Reply>) {
        let Some(item_id) = resolve_binding(session, pos) else {
            return (
                DialogState::Idle,
                vec![Reply::text("⚠️ That item is no longer available.")],
            );
        };

        match self.store.get_item(item_id).await {
            Ok(Some(item)) if item.owner_id == user_id => (
                DialogState::EditField { item_id },
                vec![Reply::edit_caption(
                    "✏️ What would you like to edit?",
                    Some(field_keyboard()),
                )],
            ),
            Ok(Some(_)) => (
                DialogState::Idle,
                vec![Reply::text("⚠️ You can only edit your own items.")],
            ),
            Ok(None) => (
                DialogState::Idle,
                vec![Reply::text("⚠️ That item is no longer available.")],
            ),
            Err(err) => (DialogState::Idle, vec![failure_reply("get_item", &err)]),
        }
    }

    /// Resolve a positional delete button and delete immediately
    /// (single-step flow, no intermediate state).
    async fn delete_at(&self, user_id: &str, session: &mut Session, pos: &str) -> Vec<Reply> {
        let Some(item_id) = resolve_binding(session, pos) else {
            return vec![Reply::text("⚠️ That item is already gone.")];
        };

        match self.store.delete_item(item_id, user_id).await {
            Ok(()) => vec![Reply::delete_message(), Reply::text("🗑 Item deleted.")],
            Err(StoreError::ItemNotFound { .. }) => {
                vec![Reply::text("⚠️ That item is already gone.")]
            }
            Err(StoreError::NotOwner { .. }) => {
                vec![Reply::text("⚠️ You can only delete your own items.")]
            }
            Err(err) => vec![failure_reply("delete_item", &err)],
        }
    }

    /// Execute a search over a point-in-time snapshot of all items.
    async fn run_query(
        &self,
        session: &mut Session,
        kind: QueryKind,
        keyword: &str,
    ) -> (DialogState, Vec<Reply>) {
        let items = match self.store.list_items().await {
            Ok(items) => items,
            Err(err) => {
                return (
                    DialogState::SearchQuery { kind },
                    vec![failure_reply("list_items", &err)],
                );
            }
        };

        let search = SearchSession::execute(kind, keyword, &items);
        debug!(keyword, results = search.len(), "Search executed");

        if search.is_empty() {
            return (
                DialogState::Idle,
                vec![
                    Reply::text(format!("🔍 No items found for \"{keyword}\".")),
                    menu_reply(),
                ],
            );
        }

        session.search = Some(search);
        self.render_search_current(session).await
    }

    /// Render the candidate at the cursor, skipping ids that were deleted
    /// since the snapshot was taken.
    async fn render_search_current(&self, session: &mut Session) -> (DialogState, Vec<Reply>) {
        loop {
            let Some(search) = session.search.as_mut() else {
                return (DialogState::Idle, vec![menu_reply()]);
            };

            let Some(item_id) = search.current() else {
                session.search = None;
                return (
                    DialogState::Idle,
                    vec![
                        Reply::text("🔚 That's all the items for this search."),
                        menu_reply(),
                    ],
                );
            };

            match self.store.get_item(item_id).await {
                Ok(Some(item)) => {
                    return (
                        DialogState::SearchBrowse,
                        vec![Reply::photo(
                            &item.photo_ref,
                            &item.caption(),
                            Some(swipe_keyboard()),
                        )],
                    );
                }
                // Deleted since the snapshot; skip without surfacing.
                Ok(None) => search.advance(),
                Err(err) => {
                    return (
                        DialogState::SearchBrowse,
                        vec![failure_reply("get_item", &err)],
                    );
                }
            }
        }
    }

    /// Confirm a match on the current candidate and end the session.
    async fn confirm_match(&self, session: &mut Session) -> (DialogState, Vec<Reply>) {
        let Some(search) = session.search.as_mut() else {
            return (DialogState::Idle, vec![menu_reply()]);
        };

        let Some(item_id) = search.current() else {
            session.search = None;
            return (
                DialogState::Idle,
                vec![
                    Reply::text("🔚 That's all the items for this search."),
                    menu_reply(),
                ],
            );
        };

        match self.store.get_item(item_id).await {
            Ok(Some(item)) => {
                session.search = None;
                (
                    DialogState::Idle,
                    vec![
                        Reply::text(format!(
                            "🤝 It's a match! Contact the owner to arrange the swap:\n📞 {}",
                            item.contact
                        )),
                        menu_reply(),
                    ],
                )
            }
            Ok(None) => {
                // The candidate vanished between render and match; move on.
                search.advance();
                let (state, mut replies) = self.render_search_current(session).await;
                replies.insert(
                    0,
                    Reply::text("⚠️ That item just became unavailable."),
                );
                (state, replies)
            }
            Err(err) => (
                DialogState::SearchBrowse,
                vec![failure_reply("get_item", &err)],
            ),
        }
    }
}

// ── Keyboards and small helpers ─────────────────────────────────────

fn main_menu() -> Keyboard {
    Keyboard::Reply(vec![
        vec![MENU_MY_PROFILE.to_string(), MENU_MY_ITEMS.to_string()],
        vec![MENU_SEARCH.to_string(), MENU_UPLOAD.to_string()],
    ])
}

fn menu_reply() -> Reply {
    Reply::text_with("📋 Main Menu:", main_menu())
}

fn create_profile_keyboard() -> Keyboard {
    Keyboard::Reply(vec![vec![MENU_CREATE_PROFILE.to_string()]])
}

fn field_keyboard() -> Keyboard {
    Keyboard::Inline(vec![
        vec![
            InlineButton::new("Name", "field:name"),
            InlineButton::new("Category", "field:category"),
        ],
        vec![
            InlineButton::new("Description", "field:description"),
            InlineButton::new("Wanted Item", "field:wanted"),
        ],
    ])
}

fn kind_keyboard() -> Keyboard {
    let button = |kind: QueryKind| {
        InlineButton::new(kind.label(), &format!("{TAG_KIND_PREFIX}{}", kind.tag()))
    };
    Keyboard::Inline(vec![
        vec![button(QueryKind::Common)],
        vec![button(QueryKind::ByName), button(QueryKind::ByWanted)],
    ])
}

fn swipe_keyboard() -> Keyboard {
    Keyboard::Inline(vec![vec![
        InlineButton::new("🤝 Match", TAG_MATCH),
        InlineButton::new("➡️ Pass", TAG_PASS),
    ]])
}

fn item_buttons(pos: usize) -> Keyboard {
    Keyboard::Inline(vec![vec![
        InlineButton::new("✏️ Edit", &format!("{TAG_EDIT_PREFIX}{pos}")),
        InlineButton::new("❌ Delete", &format!("{TAG_DELETE_PREFIX}{pos}")),
    ]])
}

/// Resolve a positional button tag through the render-time bindings.
fn resolve_binding(session: &Session, pos: &str) -> Option<i64> {
    let pos: usize = pos.parse().ok()?;
    session.bindings.get(pos).copied()
}

fn failure_reply(op: &str, err: &StoreError) -> Reply {
    warn!(op, error = %err, "Store operation failed");
    Reply::text("⚠️ Something went wrong on our side. Please try again.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

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

    fn photo_captions(replies: &[Reply]) -> Vec<String> {
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

    async fn create_profile(engine: &DialogEngine, user: &str, name: &str, contact: &str) {
        text(engine, user, MENU_CREATE_PROFILE).await;
        text(engine, user, name).await;
        let replies = text(engine, user, contact).await;
        assert!(texts(&replies)[0].contains("Profile created"));
    }

    async fn upload_item(
        engine: &DialogEngine,
        user: &str,
        name: &str,
        category: &str,
        wanted: &str,
    ) {
        text(engine, user, MENU_UPLOAD).await;
        engine
            .handle_event(user, Event::Photo(format!("{user}_photo.jpg")))
            .await;
        text(engine, user, name).await;
        text(engine, user, category).await;
        text(engine, user, "a fine item").await;
        let replies = text(engine, user, wanted).await;
        assert!(
            texts(&replies)[0].contains("uploaded"),
            "unexpected: {replies:?}"
        );
    }

    // ── /start and menu ─────────────────────────────────────────────

    #[tokio::test]
    async fn start_without_profile_offers_creation() {
        let (_store, engine) = fixture().await;
        let replies = text(&engine, "alice", "/start").await;
        assert!(texts(&replies)[0].contains("Welcome"));
        assert_eq!(
            replies[0].keyboard,
            Some(Keyboard::Reply(vec![vec![MENU_CREATE_PROFILE.to_string()]]))
        );
    }

    #[tokio::test]
    async fn start_with_profile_shows_menu() {
        let (_store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        let replies = text(&engine, "alice", "/start").await;
        assert_eq!(texts(&replies), vec!["📋 Main Menu:"]);
    }

    #[tokio::test]
    async fn unknown_text_at_idle_keeps_idle() {
        let (_store, engine) = fixture().await;
        let replies = text(&engine, "alice", "hello there").await;
        assert!(texts(&replies)[0].contains("didn't catch that"));
        assert!(engine.current_state("alice").await.is_idle());
    }

    // ── Profile flow ────────────────────────────────────────────────

    #[tokio::test]
    async fn profile_flow_commits_profile() {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;

        let profile = store.get_profile("alice").await.unwrap().unwrap();
        assert_eq!(profile.display_name, "Alice");
        assert_eq!(profile.contact, "@alice");
        assert!(engine.current_state("alice").await.is_idle());
    }

    #[tokio::test]
    async fn profile_recreation_replaces_record() {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        create_profile(&engine, "alice", "Alice B", "+1-555").await;

        let profile = store.get_profile("alice").await.unwrap().unwrap();
        assert_eq!(profile.display_name, "Alice B");
        assert_eq!(profile.contact, "+1-555");
    }

    #[tokio::test]
    async fn photo_during_profile_flow_is_rejected_in_place() {
        let (_store, engine) = fixture().await;
        text(&engine, "alice", MENU_CREATE_PROFILE).await;

        let replies = engine
            .handle_event("alice", Event::Photo("x.jpg".into()))
            .await;
        assert!(texts(&replies)[0].contains("expecting a text message"));
        assert_eq!(
            engine.current_state("alice").await,
            DialogState::ProfileName
        );

        // The flow still completes normally afterwards.
        text(&engine, "alice", "Alice").await;
        let replies = text(&engine, "alice", "@alice").await;
        assert!(texts(&replies)[0].contains("Profile created"));
    }

    // ── Upload flow ─────────────────────────────────────────────────

    #[tokio::test]
    async fn upload_flow_commits_item_with_contact_snapshot() {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        upload_item(&engine, "alice", "Football boots", "football", "Tennis racket").await;

        let items = store.list_items_by_owner("alice").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Football boots");
        assert_eq!(items[0].category, "football");
        assert_eq!(items[0].wanted, "Tennis racket");
        assert_eq!(items[0].contact, "@alice");
        assert_eq!(items[0].photo_ref, "alice_photo.jpg");
    }

    #[tokio::test]
    async fn upload_without_profile_aborts_to_idle() {
        let (store, engine) = fixture().await;
        text(&engine, "ghost", MENU_UPLOAD).await;
        engine
            .handle_event("ghost", Event::Photo("g.jpg".into()))
            .await;
        text(&engine, "ghost", "Boots").await;
        text(&engine, "ghost", "football").await;
        text(&engine, "ghost", "nice").await;
        let replies = text(&engine, "ghost", "racket").await;

        assert!(texts(&replies)[0].contains("create a profile first"));
        assert!(engine.current_state("ghost").await.is_idle());
        assert!(store.list_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn text_before_photo_in_upload_is_rejected_in_place() {
        let (_store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        text(&engine, "alice", MENU_UPLOAD).await;

        let replies = text(&engine, "alice", "Football boots").await;
        assert!(texts(&replies)[0].contains("expecting a photo"));
        assert_eq!(engine.current_state("alice").await, DialogState::UploadPhoto);
    }

    // ── Out-of-order events ─────────────────────────────────────────

    #[tokio::test]
    async fn edit_value_before_edit_flow_leaves_idle() {
        let (_store, engine) = fixture().await;
        // A field button press on a fresh session must not conjure up an
        // edit sub-state.
        let replies = button(&engine, "alice", "field:name").await;
        assert!(texts(&replies)[0].contains("isn't active"));
        assert!(engine.current_state("alice").await.is_idle());
    }

    #[tokio::test]
    async fn swipe_buttons_outside_search_are_rejected() {
        let (_store, engine) = fixture().await;
        let replies = button(&engine, "alice", "match").await;
        assert!(texts(&replies)[0].contains("isn't active"));
        assert!(engine.current_state("alice").await.is_idle());
    }

    // ── My Items, edit, delete ──────────────────────────────────────

    #[tokio::test]
    async fn my_items_renders_photo_per_item() {
        let (_store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        upload_item(&engine, "alice", "Boots", "football", "racket").await;
        upload_item(&engine, "alice", "Mat", "gym", "gloves").await;

        let replies = text(&engine, "alice", MENU_MY_ITEMS).await;
        let captions = photo_captions(&replies);
        assert_eq!(captions.len(), 2);
        assert!(captions[0].contains("Boots"));
        assert!(captions[1].contains("Mat"));
        assert_eq!(
            replies[0].keyboard,
            Some(Keyboard::Inline(vec![vec![
                InlineButton::new("✏️ Edit", "edit:0"),
                InlineButton::new("❌ Delete", "delete:0"),
            ]]))
        );
    }

    #[tokio::test]
    async fn my_items_empty_list() {
        let (_store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        let replies = text(&engine, "alice", MENU_MY_ITEMS).await;
        assert!(texts(&replies)[0].contains("haven't uploaded"));
    }

    #[tokio::test]
    async fn edit_flow_updates_single_field() {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        upload_item(&engine, "alice", "Boots", "misc", "racket").await;

        text(&engine, "alice", MENU_MY_ITEMS).await;
        let replies = button(&engine, "alice", "edit:0").await;
        assert!(matches!(&replies[0].kind, ReplyKind::EditCaption(c) if c.contains("edit")));

        button(&engine, "alice", "field:category").await;
        let replies = text(&engine, "alice", "football").await;
        assert!(texts(&replies)[0].contains("Category updated to: football"));

        let items = store.list_items_by_owner("alice").await.unwrap();
        assert_eq!(items[0].category, "football");
        assert_eq!(items[0].name, "Boots");
        assert!(engine.current_state("alice").await.is_idle());
    }

    #[tokio::test]
    async fn delete_flow_removes_item_and_message() {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        upload_item(&engine, "alice", "Boots", "misc", "racket").await;

        text(&engine, "alice", MENU_MY_ITEMS).await;
        let replies = button(&engine, "alice", "delete:0").await;
        assert_eq!(replies[0].kind, ReplyKind::DeleteMessage);
        assert!(texts(&replies)[0].contains("deleted"));
        assert!(store.list_items().await.unwrap().is_empty());

        // Pressing the same stale button again reports it gone, no crash.
        let replies = button(&engine, "alice", "delete:0").await;
        assert!(texts(&replies)[0].contains("already gone"));
    }

    #[tokio::test]
    async fn positional_binding_survives_out_of_band_delete() {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        upload_item(&engine, "alice", "Item A", "misc", "x").await;
        upload_item(&engine, "alice", "Item B", "misc", "y").await;

        let ids: Vec<i64> = store
            .list_items_by_owner("alice")
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();

        // Render binds position 0 -> A, position 1 -> B.
        text(&engine, "alice", MENU_MY_ITEMS).await;

        // A disappears out of band.
        store.delete_item(ids[0], "alice").await.unwrap();

        // Position 1 still resolves to B's stable id, not to "whatever is
        // second in the owner's list now".
        let replies = button(&engine, "alice", "delete:1").await;
        assert!(texts(&replies)[0].contains("deleted"));
        assert!(store.get_item(ids[1]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_edit_binding_reports_not_found() {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        upload_item(&engine, "alice", "Boots", "misc", "x").await;

        let id = store.list_items_by_owner("alice").await.unwrap()[0].id;
        text(&engine, "alice", MENU_MY_ITEMS).await;
        store.delete_item(id, "alice").await.unwrap();

        let replies = button(&engine, "alice", "edit:0").await;
        assert!(texts(&replies)[0].contains("no longer available"));
        assert!(engine.current_state("alice").await.is_idle());
    }

    #[tokio::test]
    async fn binding_out_of_range_is_not_found() {
        let (_store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        upload_item(&engine, "alice", "Boots", "misc", "x").await;
        text(&engine, "alice", MENU_MY_ITEMS).await;

        let replies = button(&engine, "alice", "edit:7").await;
        assert!(texts(&replies)[0].contains("no longer available"));
        let replies = button(&engine, "alice", "delete:not-a-number").await;
        assert!(texts(&replies)[0].contains("already gone"));
    }

    // ── Search flow ─────────────────────────────────────────────────

    async fn seeded_engine() -> (Arc<LibSqlBackend>, DialogEngine) {
        let (store, engine) = fixture().await;
        create_profile(&engine, "alice", "Alice", "@alice").await;
        create_profile(&engine, "bob", "Bob", "@bob").await;
        upload_item(&engine, "alice", "Football boots", "football", "Tennis racket").await;
        upload_item(&engine, "bob", "Tennis racket", "tennis", "Gym gloves").await;
        (store, engine)
    }

    #[tokio::test]
    async fn search_by_name_shows_matching_item() {
        let (_store, engine) = seeded_engine().await;

        text(&engine, "bob", MENU_SEARCH).await;
        button(&engine, "bob", "kind:name").await;
        let replies = text(&engine, "bob", "boot").await;

        let captions = photo_captions(&replies);
        assert_eq!(captions.len(), 1);
        assert!(captions[0].contains("Football boots"));
        assert_eq!(engine.current_state("bob").await, DialogState::SearchBrowse);
    }

    #[tokio::test]
    async fn search_match_reveals_contact_and_ends() {
        let (_store, engine) = seeded_engine().await;

        text(&engine, "bob", MENU_SEARCH).await;
        button(&engine, "bob", "kind:name").await;
        text(&engine, "bob", "boot").await;
        let replies = button(&engine, "bob", "match").await;

        assert!(texts(&replies)[0].contains("@alice"));
        assert!(engine.current_state("bob").await.is_idle());

        // The session is discarded; further swipes are stale.
        let replies = button(&engine, "bob", "pass").await;
        assert!(texts(&replies)[0].contains("isn't active"));
    }

    #[tokio::test]
    async fn search_pass_past_end_terminates() {
        let (_store, engine) = seeded_engine().await;

        text(&engine, "bob", MENU_SEARCH).await;
        button(&engine, "bob", "kind:name").await;
        text(&engine, "bob", "boot").await;
        let replies = button(&engine, "bob", "pass").await;

        assert!(texts(&replies)[0].contains("all the items"));
        assert!(engine.current_state("bob").await.is_idle());
    }

    #[tokio::test]
    async fn search_no_results_returns_to_idle() {
        let (_store, engine) = seeded_engine().await;

        text(&engine, "bob", MENU_SEARCH).await;
        button(&engine, "bob", "kind:common").await;
        let replies = text(&engine, "bob", "submarine").await;

        assert!(texts(&replies)[0].contains("No items found"));
        assert!(engine.current_state("bob").await.is_idle());
    }

    #[tokio::test]
    async fn empty_keyword_is_rejected_in_place() {
        let (_store, engine) = seeded_engine().await;

        text(&engine, "bob", MENU_SEARCH).await;
        button(&engine, "bob", "kind:common").await;
        let replies = text(&engine, "bob", "   ").await;

        assert!(texts(&replies)[0].contains("can't be empty"));
        assert_eq!(
            engine.current_state("bob").await,
            DialogState::SearchQuery {
                kind: QueryKind::Common
            }
        );
    }

    #[tokio::test]
    async fn search_skips_items_deleted_since_snapshot() {
        let (store, engine) = seeded_engine().await;

        // Two results for "racket": Alice wants one, Bob offers one.
        text(&engine, "alice", MENU_SEARCH).await;
        button(&engine, "alice", "kind:common").await;
        let replies = text(&engine, "alice", "racket").await;
        assert!(photo_captions(&replies)[0].contains("Football boots"));

        // Bob's racket disappears mid-session.
        let bob_item = store.list_items_by_owner("bob").await.unwrap()[0].id;
        store.delete_item(bob_item, "bob").await.unwrap();

        // Pass skips the deleted candidate straight to the terminal state.
        let replies = button(&engine, "alice", "pass").await;
        assert!(texts(&replies)[0].contains("all the items"));
        assert!(engine.current_state("alice").await.is_idle());
    }

    #[tokio::test]
    async fn match_on_deleted_item_degrades_safely() {
        let (store, engine) = seeded_engine().await;

        text(&engine, "bob", MENU_SEARCH).await;
        button(&engine, "bob", "kind:name").await;
        text(&engine, "bob", "boot").await;

        let alice_item = store.list_items_by_owner("alice").await.unwrap()[0].id;
        store.delete_item(alice_item, "alice").await.unwrap();

        let replies = button(&engine, "bob", "match").await;
        assert!(texts(&replies)[0].contains("unavailable"));
        assert!(engine.current_state("bob").await.is_idle());
    }

    // ── Interleaved users ───────────────────────────────────────────

    /// Store wrapper that parks `get_profile` calls for one user until
    /// released, to observe what a stalled store call blocks.
    struct GatedStore {
        inner: Arc<LibSqlBackend>,
        gate: Arc<tokio::sync::Notify>,
        slow_user: String,
    }

    #[async_trait::async_trait]
    impl Store for GatedStore {
        async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
            self.inner.upsert_profile(profile).await
        }

        async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
            if user_id == self.slow_user {
                self.gate.notified().await;
            }
            self.inner.get_profile(user_id).await
        }

        async fn insert_item(&self, item: NewItem) -> Result<i64, StoreError> {
            self.inner.insert_item(item).await
        }

        async fn list_items(&self) -> Result<Vec<crate::model::Item>, StoreError> {
            self.inner.list_items().await
        }

        async fn list_items_by_owner(
            &self,
            owner_id: &str,
        ) -> Result<Vec<crate::model::Item>, StoreError> {
            self.inner.list_items_by_owner(owner_id).await
        }

        async fn get_item(&self, id: i64) -> Result<Option<crate::model::Item>, StoreError> {
            self.inner.get_item(id).await
        }

        async fn update_item_field(
            &self,
            id: i64,
            field: ItemField,
            value: &str,
            caller_id: &str,
        ) -> Result<(), StoreError> {
            self.inner.update_item_field(id, field, value, caller_id).await
        }

        async fn delete_item(&self, id: i64, caller_id: &str) -> Result<(), StoreError> {
            self.inner.delete_item(id, caller_id).await
        }
    }

    #[tokio::test]
    async fn one_users_stalled_store_call_does_not_block_others() {
        let inner = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let gate = Arc::new(tokio::sync::Notify::new());
        let store = Arc::new(GatedStore {
            inner,
            gate: Arc::clone(&gate),
            slow_user: "slow".to_string(),
        });
        let engine = Arc::new(DialogEngine::new(store as Arc<dyn Store>));

        // "/start" looks up the profile, which parks until the gate opens.
        let parked = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.handle_event("slow", Event::Text("/start".into())).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Another user's whole profile flow completes while "slow" holds
        // only their own session lock.
        let done = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            create_profile(&engine, "alice", "Alice", "@alice").await;
        })
        .await;
        assert!(done.is_ok(), "other users must progress while one is parked");

        gate.notify_one();
        let replies = parked.await.unwrap();
        assert!(texts(&replies)[0].contains("Welcome"));
    }

    #[tokio::test]
    async fn sessions_do_not_cross_talk() {
        let (store, engine) = fixture().await;

        // Alice and Bob progress through the profile flow interleaved.
        text(&engine, "alice", MENU_CREATE_PROFILE).await;
        text(&engine, "bob", MENU_CREATE_PROFILE).await;
        text(&engine, "alice", "Alice").await;
        text(&engine, "bob", "Bob").await;
        text(&engine, "bob", "@bob").await;
        text(&engine, "alice", "@alice").await;

        let alice = store.get_profile("alice").await.unwrap().unwrap();
        let bob = store.get_profile("bob").await.unwrap().unwrap();
        assert_eq!(alice.display_name, "Alice");
        assert_eq!(alice.contact, "@alice");
        assert_eq!(bob.display_name, "Bob");
        assert_eq!(bob.contact, "@bob");
    }
}
