use super::RosterConfig;

/// The loopback form of a `Transport:host:port` peer id.
///
/// Agents on this host are known under their loopback address, but removal
/// notices may name any local address, or none. Returns `None` when the host
/// segment is not local or the id is already in loopback form.
pub fn loopback_alias(id: &str, config: &RosterConfig) -> Option<String> {
    let begin = id.find(':')?;
    let end = id.rfind(':')?;
    if begin == end {
        return None;
    }
    let host = &id[begin + 1..end];
    if host == config.loopback || !(host.is_empty() || config.is_local_host(host)) {
        return None;
    }
    Some(format!("{}:{}{}", &id[..begin], config.loopback, &id[end..]))
}
