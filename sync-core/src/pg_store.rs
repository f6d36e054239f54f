use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::sync::Arc;
use tracing;

use crate::db::{DbConnection, DbPool};
use crate::error::RemoteError;
use crate::ports::RemoteStore;
use crate::redis::ChangePublisher;
use crate::schema::{messages, notifications, profiles, threads};
use crate::scope::{ResourceScope, RowEvent};
use crate::types::{
    Identity, Message, MessageId, NewMessage, NewThread, Notification, NotificationId,
    NotificationType, ReadTarget, Role, Thread, ThreadId, UserId,
};

#[derive(Queryable, Selectable)]
#[diesel(table_name = threads)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ThreadRow {
    id: String,
    client_id: String,
    provider_id: String,
    client_name: String,
    provider_name: String,
    last_message_preview: Option<String>,
    last_activity_at: DateTime<Utc>,
    client_unread_count: i32,
    provider_unread_count: i32,
}

impl From<ThreadRow> for Thread {
    fn from(row: ThreadRow) -> Self {
        Thread {
            id: ThreadId(row.id),
            client_id: UserId(row.client_id),
            provider_id: UserId(row.provider_id),
            client_name: row.client_name,
            provider_name: row.provider_name,
            last_message_preview: row.last_message_preview,
            last_activity_at: row.last_activity_at,
            client_unread_count: u32::try_from(row.client_unread_count).unwrap_or(0),
            provider_unread_count: u32::try_from(row.provider_unread_count).unwrap_or(0),
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: String,
    thread_id: String,
    sender_id: String,
    sender_role: String,
    body: Option<String>,
    attachment_url: Option<String>,
    created_at: DateTime<Utc>,
    read_by_client: bool,
    read_by_provider: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let sender_role = Role::parse(&row.sender_role).unwrap_or_else(|| {
            tracing::warn!("Message {} has unknown sender_role {:?}", row.id, row.sender_role);
            Role::Client
        });
        Message {
            id: MessageId(row.id),
            thread_id: ThreadId(row.thread_id),
            sender_id: UserId(row.sender_id),
            sender_role,
            body: row.body,
            attachment_url: row.attachment_url,
            created_at: row.created_at,
            read_by_client: row.read_by_client,
            read_by_provider: row.read_by_provider,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct NotificationRow {
    id: String,
    recipient_id: String,
    notification_type: String,
    title: String,
    body: String,
    booking_id: Option<String>,
    thread_id: Option<String>,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: NotificationId(row.id),
            recipient_id: UserId(row.recipient_id),
            kind: NotificationType::parse(&row.notification_type),
            title: row.title,
            body: row.body,
            created_at: row.created_at,
            is_read: row.is_read,
            booking_id: row.booking_id,
            thread_id: row.thread_id.map(ThreadId),
        }
    }
}

/// Remote store backed by Postgres. When a publisher is attached every write
/// is followed by the matching change events on the scope streams.
#[derive(Clone)]
pub struct PgRemoteStore {
    pool: Arc<DbPool>,
    publisher: Option<ChangePublisher>,
}

impl PgRemoteStore {
    pub fn new(pool: Arc<DbPool>, publisher: Option<ChangePublisher>) -> Self {
        Self { pool, publisher }
    }

    async fn conn(&self) -> Result<DbConnection, RemoteError> {
        self.pool
            .get()
            .await
            .map_err(|e| RemoteError::Transport(format!("Failed to get database connection: {}", e)))
    }

    async fn publish(&self, scopes: &[ResourceScope], event: RowEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(scopes, &event).await;
        }
    }

    async fn publish_thread(&self, thread: &Thread, event: RowEvent) {
        let scopes = [
            ResourceScope::threads_of(&thread.client_id),
            ResourceScope::threads_of(&thread.provider_id),
        ];
        self.publish(&scopes, event).await;
    }

    async fn display_name(conn: &mut DbConnection, user: &UserId) -> Result<String, RemoteError> {
        let name: Option<String> = profiles::table
            .find(user.as_str())
            .select(profiles::display_name)
            .first(conn)
            .await
            .optional()?;
        Ok(name.unwrap_or_else(|| user.to_string()))
    }
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn fetch_threads(&self, identity: &Identity) -> Result<Vec<Thread>, RemoteError> {
        let mut conn = self.conn().await?;
        let rows: Vec<ThreadRow> = threads::table
            .filter(
                threads::client_id
                    .eq(identity.id.as_str())
                    .or(threads::provider_id.eq(identity.id.as_str())),
            )
            .order((threads::last_activity_at.desc(), threads::id.asc()))
            .select(ThreadRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows.into_iter().map(Thread::from).collect())
    }

    async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RemoteError> {
        let mut conn = self.conn().await?;
        let rows: Vec<MessageRow> = messages::table
            .filter(messages::thread_id.eq(thread_id.as_str()))
            .order((messages::created_at.asc(), messages::id.asc()))
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn fetch_notifications(&self, identity: &Identity) -> Result<Vec<Notification>, RemoteError> {
        let mut conn = self.conn().await?;
        let rows: Vec<NotificationRow> = notifications::table
            .filter(notifications::recipient_id.eq(identity.id.as_str()))
            .order((notifications::created_at.desc(), notifications::id.desc()))
            .select(NotificationRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn create_thread(&self, pair: &NewThread) -> Result<Thread, RemoteError> {
        let mut conn = self.conn().await?;
        let client_name = Self::display_name(&mut conn, &pair.client_id).await?;
        let provider_name = Self::display_name(&mut conn, &pair.provider_id).await?;

        // The unique pair index decides races; the loser inserts nothing and
        // reads the winner's row below.
        let inserted = diesel::insert_into(threads::table)
            .values((
                threads::id.eq(ThreadId::generate().as_str()),
                threads::client_id.eq(pair.client_id.as_str()),
                threads::provider_id.eq(pair.provider_id.as_str()),
                threads::client_name.eq(&client_name),
                threads::provider_name.eq(&provider_name),
                threads::last_activity_at.eq(Utc::now()),
            ))
            .on_conflict((threads::client_id, threads::provider_id))
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let row: ThreadRow = threads::table
            .filter(threads::client_id.eq(pair.client_id.as_str()))
            .filter(threads::provider_id.eq(pair.provider_id.as_str()))
            .select(ThreadRow::as_select())
            .first(&mut conn)
            .await?;
        let thread = Thread::from(row);

        if inserted > 0 {
            tracing::debug!("Created thread {} for {} / {}", thread.id, pair.client_id, pair.provider_id);
            self.publish_thread(&thread, RowEvent::insert(&thread)).await;
        }

        Ok(thread)
    }

    async fn insert_message(&self, draft: &NewMessage) -> Result<Message, RemoteError> {
        let mut conn = self.conn().await?;
        let mut message = draft.to_message(MessageId::generate());
        // timestamptz keeps microseconds; return what a later fetch will see.
        message.created_at = message.created_at.trunc_subsecs(6);

        let row: ThreadRow = {
            let message = &message;
            conn.transaction::<_, RemoteError, _>(|conn| {
                async move {
                    diesel::insert_into(messages::table)
                        .values((
                            messages::id.eq(message.id.as_str()),
                            messages::thread_id.eq(message.thread_id.as_str()),
                            messages::sender_id.eq(message.sender_id.as_str()),
                            messages::sender_role.eq(message.sender_role.as_str()),
                            messages::body.eq(message.body.as_deref()),
                            messages::attachment_url.eq(message.attachment_url.as_deref()),
                            messages::created_at.eq(message.created_at),
                            messages::read_by_client.eq(message.read_by_client),
                            messages::read_by_provider.eq(message.read_by_provider),
                        ))
                        .execute(conn)
                        .await?;

                    let preview = message.preview();
                    let target = threads::table.find(message.thread_id.as_str());
                    let row = match message.sender_role.other() {
                        Role::Client => {
                            diesel::update(target)
                                .set((
                                    threads::last_activity_at.eq(message.created_at),
                                    threads::last_message_preview.eq(&preview),
                                    threads::client_unread_count.eq(threads::client_unread_count + 1),
                                ))
                                .returning(ThreadRow::as_returning())
                                .get_result(conn)
                                .await?
                        }
                        Role::Provider => {
                            diesel::update(target)
                                .set((
                                    threads::last_activity_at.eq(message.created_at),
                                    threads::last_message_preview.eq(&preview),
                                    threads::provider_unread_count.eq(threads::provider_unread_count + 1),
                                ))
                                .returning(ThreadRow::as_returning())
                                .get_result(conn)
                                .await?
                        }
                    };
                    Ok(row)
                }
                .scope_boxed()
            })
            .await?
        };
        let thread = Thread::from(row);

        self.publish(
            &[ResourceScope::messages_in(&message.thread_id)],
            RowEvent::insert(&message),
        )
        .await;
        self.publish_thread(&thread, RowEvent::update(&thread)).await;

        Ok(message)
    }

    async fn mark_read(&self, identity: &Identity, target: &ReadTarget) -> Result<(), RemoteError> {
        let mut conn = self.conn().await?;
        let me = identity.id.as_str();

        match target {
            ReadTarget::Thread(thread_id) => {
                let role = identity.role;
                let (row, updated) = conn
                    .transaction::<_, RemoteError, _>(|conn| {
                        async move {
                            // Ownership first: the counter reset only matches a
                            // thread where the caller is the participant of its role.
                            let owned = threads::table.filter(threads::id.eq(thread_id.as_str()));
                            let row: Option<ThreadRow> = match role {
                                Role::Client => diesel::update(owned.filter(threads::client_id.eq(me)))
                                    .set(threads::client_unread_count.eq(0))
                                    .returning(ThreadRow::as_returning())
                                    .get_result(conn)
                                    .await
                                    .optional()?,
                                Role::Provider => diesel::update(owned.filter(threads::provider_id.eq(me)))
                                    .set(threads::provider_unread_count.eq(0))
                                    .returning(ThreadRow::as_returning())
                                    .get_result(conn)
                                    .await
                                    .optional()?,
                            };
                            let Some(row) = row else {
                                return Err(RemoteError::NotFound(format!("thread {}", thread_id)));
                            };

                            let unread = messages::table
                                .filter(messages::thread_id.eq(thread_id.as_str()))
                                .filter(messages::sender_id.ne(me));
                            let updated: Vec<MessageRow> = match role {
                                Role::Client => {
                                    diesel::update(unread.filter(messages::read_by_client.eq(false)))
                                        .set(messages::read_by_client.eq(true))
                                        .returning(MessageRow::as_returning())
                                        .get_results(conn)
                                        .await?
                                }
                                Role::Provider => {
                                    diesel::update(unread.filter(messages::read_by_provider.eq(false)))
                                        .set(messages::read_by_provider.eq(true))
                                        .returning(MessageRow::as_returning())
                                        .get_results(conn)
                                        .await?
                                }
                            };
                            Ok((row, updated))
                        }
                        .scope_boxed()
                    })
                    .await?;
                let thread = Thread::from(row);

                let scope = [ResourceScope::messages_in(thread_id)];
                for message in updated.into_iter().map(Message::from) {
                    self.publish(&scope, RowEvent::update(&message)).await;
                }
                self.publish_thread(&thread, RowEvent::update(&thread)).await;
            }
            ReadTarget::Notification(id) => {
                let updated: Vec<NotificationRow> = diesel::update(
                    notifications::table
                        .filter(notifications::id.eq(id.as_str()))
                        .filter(notifications::recipient_id.eq(me))
                        .filter(notifications::is_read.eq(false)),
                )
                .set(notifications::is_read.eq(true))
                .returning(NotificationRow::as_returning())
                .get_results(&mut conn)
                .await?;
                self.publish_notifications(identity, updated).await;
            }
            ReadTarget::AllNotifications => {
                let updated: Vec<NotificationRow> = diesel::update(
                    notifications::table
                        .filter(notifications::recipient_id.eq(me))
                        .filter(notifications::is_read.eq(false)),
                )
                .set(notifications::is_read.eq(true))
                .returning(NotificationRow::as_returning())
                .get_results(&mut conn)
                .await?;
                tracing::debug!("Marked {} notifications read for {}", updated.len(), me);
                self.publish_notifications(identity, updated).await;
            }
        }

        Ok(())
    }

    async fn delete_notification(&self, identity: &Identity, id: &NotificationId) -> Result<(), RemoteError> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(
            notifications::table
                .filter(notifications::id.eq(id.as_str()))
                .filter(notifications::recipient_id.eq(identity.id.as_str())),
        )
        .execute(&mut conn)
        .await?;

        if deleted > 0 {
            self.publish(
                &[ResourceScope::notifications_for(&identity.id)],
                RowEvent::delete(id.as_str()),
            )
            .await;
        }

        Ok(())
    }
}

impl PgRemoteStore {
    async fn publish_notifications(&self, identity: &Identity, rows: Vec<NotificationRow>) {
        let scope = [ResourceScope::notifications_for(&identity.id)];
        for notification in rows.into_iter().map(Notification::from) {
            self.publish(&scope, RowEvent::update(&notification)).await;
        }
    }
}
