diesel::table! {
    catalog_items (id) {
        id -> Int8,
        name -> Varchar,
        unit_price -> Numeric,
        initial_quantity -> Int4,
        remaining_quantity -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    claims (id) {
        id -> Int8,
        resource_id -> Int8,
        actor_id -> Int8,
        display_name -> Nullable<Varchar>,
        sequence_number -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Int8,
        invoice_no -> Varchar,
        buyer_id -> Int8,
        buyer_name -> Nullable<Varchar>,
        delivery_method -> Varchar,
        cards_subtotal -> Numeric,
        delivery_fee -> Numeric,
        total -> Numeric,
        status -> Varchar,
        payment_proof_ref -> Nullable<Varchar>,
        payment_proof_kind -> Nullable<Varchar>,
        tracking_number -> Nullable<Varchar>,
        shipping_proof_ref -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_lines (id) {
        id -> Int8,
        order_id -> Int8,
        resource_id -> Int8,
        name -> Varchar,
        unit_price -> Numeric,
        quantity -> Int4,
    }
}

diesel::table! {
    shipping_addresses (order_id) {
        order_id -> Int8,
        recipient -> Varchar,
        street -> Varchar,
        unit -> Varchar,
        postal_code -> Varchar,
        phone -> Varchar,
        confirmed -> Bool,
    }
}

diesel::table! {
    actor_sessions (actor_id) {
        actor_id -> Int8,
        role -> Varchar,
        session_type -> Varchar,
        payload -> Jsonb,
        updated_at -> Timestamptz,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    admin_audit_log (id) {
        id -> Int8,
        action -> Varchar,
        admin_id -> Int8,
        target_actor_id -> Int8,
        resource_id -> Int8,
        quantity -> Int4,
        reason -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_ref -> Varchar,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(claims -> catalog_items (resource_id));
diesel::joinable!(order_lines -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    catalog_items,
    claims,
    orders,
    order_lines,
    shipping_addresses,
    actor_sessions,
    admin_audit_log,
    outbox_events,
);
