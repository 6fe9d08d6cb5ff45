diesel::table! {
    tickets (id) {
        id -> Uuid,
        name -> Varchar,
        email -> Varchar,
        subject -> Varchar,
        message -> Text,
        status -> Varchar,
        rating -> Nullable<Int4>,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    ticket_replies (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        admin_name -> Varchar,
        is_from_guest -> Nullable<Bool>,
        message -> Text,
        notice -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_status_logs (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        old_status -> Nullable<Varchar>,
        new_status -> Nullable<Varchar>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(ticket_replies -> tickets (ticket_id));
diesel::joinable!(ticket_status_logs -> tickets (ticket_id));

diesel::allow_tables_to_appear_in_same_query!(tickets, ticket_replies, ticket_status_logs);
