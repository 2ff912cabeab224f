//! Hard caps on caller input and per-tenant growth.

pub const MAX_AGENDA_LEN: usize = 4_000;
pub const MAX_REASON_LEN: usize = 2_000;
pub const MAX_REFERENCE_LEN: usize = 2_048;

pub const MAX_SLOTS_PER_COUNSELOR: usize = 10_000;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
