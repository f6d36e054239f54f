use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    profiles (id) {
        id -> Text,
        display_name -> Text,
    }
}

table! {
    threads (id) {
        id -> Text,
        client_id -> Text,
        provider_id -> Text,
        client_name -> Text,
        provider_name -> Text,
        last_message_preview -> Nullable<Text>,
        last_activity_at -> Timestamptz,
        client_unread_count -> Integer,
        provider_unread_count -> Integer,
        created_at -> Timestamptz,
    }
}

table! {
    messages (id) {
        id -> Text,
        thread_id -> Text,
        sender_id -> Text,
        sender_role -> Text,
        body -> Nullable<Text>,
        attachment_url -> Nullable<Text>,
        created_at -> Timestamptz,
        read_by_client -> Bool,
        read_by_provider -> Bool,
    }
}

table! {
    notifications (id) {
        id -> Text,
        recipient_id -> Text,
        notification_type -> Text,
        title -> Text,
        body -> Text,
        booking_id -> Nullable<Text>,
        thread_id -> Nullable<Text>,
        is_read -> Bool,
        created_at -> Timestamptz,
    }
}

joinable!(messages -> threads (thread_id));

allow_tables_to_appear_in_same_query!(
    profiles,
    threads,
    messages,
    notifications,
);
