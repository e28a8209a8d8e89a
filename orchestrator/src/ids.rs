//! Generated identifiers for executions and sandbox roots.

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

/// `exec_<yyyymmdd_hhmmss>_<6 alnum>`.
pub fn execution_id() -> String {
    build_scoped_name("exec", &generate_timestamp(), &generate_short_id())
}

/// Directory name for an agent's sandbox root: `<agent>_<yyyymmdd_hhmmss>_<6 alnum>`.
///
/// Characters outside `[A-Za-z0-9._-]` in the agent id are replaced by `_`.
pub fn sandbox_dir_name(agent_id: &str) -> String {
    let safe: String = agent_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let safe = if safe.trim_matches('.').is_empty() {
        "agent".to_string()
    } else {
        safe
    };
    build_scoped_name(&safe, &generate_timestamp(), &generate_short_id())
}

pub fn build_scoped_name(prefix: &str, timestamp: &str, short_id: &str) -> String {
    format!("{prefix}_{timestamp}_{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
