//! Database schema constants.
//!
//! Statements are idempotent and applied in order by the migration runner.

/// Requests, keyed by the caller-assigned id.
pub const CREATE_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    request_id BIGINT PRIMARY KEY,
    problem_id VARCHAR(255) NOT NULL,
    student_program TEXT NOT NULL,
    student_notebook JSONB,
    hint_type VARCHAR(16) NOT NULL,
    student_program_output TEXT,
    run_time DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK ((student_program_output IS NULL) = (run_time IS NULL))
)
"#;

/// At most one reflection per request.
pub const CREATE_REFLECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reflections (
    id BIGSERIAL PRIMARY KEY,
    request_id BIGINT NOT NULL UNIQUE REFERENCES requests(request_id) ON DELETE CASCADE,
    reflection_question TEXT NOT NULL,
    reflection_answer TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_ENHANCEMENT_PHASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enhancement_phases (
    id BIGSERIAL PRIMARY KEY,
    request_id BIGINT NOT NULL REFERENCES requests(request_id) ON DELETE CASCADE,
    prompt TEXT NOT NULL,
    model_id VARCHAR(255) NOT NULL,
    model_temperature DOUBLE PRECISION NOT NULL,
    model_n INTEGER NOT NULL,
    whole_llm_response TEXT NOT NULL,
    llm_waiting_seconds DOUBLE PRECISION NOT NULL,
    n_correct_enhancements INTEGER,
    best_enhanced_program TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_ENHANCED_PROGRAMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enhanced_programs (
    id BIGSERIAL PRIMARY KEY,
    phase_id BIGINT NOT NULL REFERENCES enhancement_phases(id) ON DELETE CASCADE,
    enhanced_program TEXT NOT NULL,
    is_correct BOOLEAN,
    program_output TEXT,
    run_time DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_HINT_GENERATION_PHASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS hint_generation_phases (
    id BIGSERIAL PRIMARY KEY,
    request_id BIGINT NOT NULL REFERENCES requests(request_id) ON DELETE CASCADE,
    prompt TEXT NOT NULL,
    model_id VARCHAR(255) NOT NULL,
    model_temperature DOUBLE PRECISION NOT NULL,
    whole_llm_response TEXT NOT NULL,
    llm_waiting_seconds DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// At most one hint per request; a second insert is a duplicate key.
pub const CREATE_HINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS hints (
    id BIGSERIAL PRIMARY KEY,
    request_id BIGINT NOT NULL UNIQUE REFERENCES requests(request_id) ON DELETE CASCADE,
    hint TEXT NOT NULL,
    explanation TEXT NOT NULL,
    job_finished_successfully BOOLEAN NOT NULL,
    generation_error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_enhancement_phases_request_id ON enhancement_phases(request_id, id);
CREATE INDEX IF NOT EXISTS idx_enhanced_programs_phase_id ON enhanced_programs(phase_id, id);
CREATE INDEX IF NOT EXISTS idx_hint_generation_phases_request_id ON hint_generation_phases(request_id)
"#;

/// Marks when `generate_hint` was published for a request.
pub const ADD_HINT_REQUESTED_AT: &str = r#"
ALTER TABLE requests ADD COLUMN IF NOT EXISTS hint_requested_at TIMESTAMPTZ
"#;

/// A named schema step, applied once.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Every schema step, parents before children.
pub const MIGRATIONS: [Migration; 8] = [
    Migration {
        name: "v1_create_requests",
        sql: CREATE_REQUESTS_TABLE,
    },
    Migration {
        name: "v1_create_reflections",
        sql: CREATE_REFLECTIONS_TABLE,
    },
    Migration {
        name: "v1_create_enhancement_phases",
        sql: CREATE_ENHANCEMENT_PHASES_TABLE,
    },
    Migration {
        name: "v1_create_enhanced_programs",
        sql: CREATE_ENHANCED_PROGRAMS_TABLE,
    },
    Migration {
        name: "v1_create_hint_generation_phases",
        sql: CREATE_HINT_GENERATION_PHASES_TABLE,
    },
    Migration {
        name: "v1_create_hints",
        sql: CREATE_HINTS_TABLE,
    },
    Migration {
        name: "v1_create_indexes",
        sql: CREATE_INDEXES,
    },
    Migration {
        name: "v2_add_hint_requested_at",
        sql: ADD_HINT_REQUESTED_AT,
    },
];
