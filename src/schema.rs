//! Handwritten Diesel schema declarations used by model structs.
//!
//! Migrations define the actual tables and constraints. This module only
//! provides `diesel::table!` declarations so we can derive Insertable/Queryable
//! in a type-safe way without running `diesel print-schema`.

// Singleton row (id = 1)
diesel::table! {
    presence_state (id) {
        id -> SmallInt,
        state -> Text,  // HOME | AWAY
        stage -> Text,  // NONE | PRE_ARRIVAL | ARRIVED
        updated_at -> Timestamptz,
    }
}

// Singleton row (id = 1)
diesel::table! {
    comfort_mode (id) {
        id -> SmallInt,
        night_mode -> Bool,
        set_at -> Timestamptz,
    }
}

diesel::table! {
    zone_control_state (zone_id) {
        zone_id -> BigInt,
        power -> Text, // ON | OFF
        last_power_change_at -> Nullable<Timestamptz>,
        cycles_in_current_hour -> Integer,
        cycle_window_started_at -> Timestamptz,
        run_started_at -> Nullable<Timestamptz>,
        safety_hold -> Bool,
        target_temperature -> Nullable<Double>,
    }
}

diesel::table! {
    alert_cooldowns (alert_kind, location) {
        alert_kind -> Text,
        location -> Text,
        last_sent_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(presence_state, comfort_mode, zone_control_state, alert_cooldowns,);
