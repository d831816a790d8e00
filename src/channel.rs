//! Channel identity and the single role/topic authorization table.
//!
//! A channel id is `"<topic>_<customerId>"`. It is derived, never allocated,
//! so any client that knows the topic and customer lands on the same channel.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    auth::Identity,
    error::{ChatError, ChatResult},
    types::{Role, Topic, TopicFilter},
};

static CUSTOMER_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@:-]{0,127}$").ok());

/// Which topics each role may touch. Customers are further narrowed to
/// their own id in [`authorize_channel`].
const POLICY: &[(Role, Topic)] = &[
    (Role::Customer, Topic::Support),
    (Role::Customer, Topic::Consultant),
    (Role::Support, Topic::Support),
    (Role::Consultant, Topic::Consultant),
    (Role::Admin, Topic::Support),
    (Role::Admin, Topic::Consultant),
];

pub fn channel_id(topic: Topic, customer_id: &str) -> ChatResult<String> {
    let customer_id = validate_customer_id(customer_id)?;
    Ok(format!("{}{}", topic.channel_prefix(), customer_id))
}

pub fn validate_customer_id(customer_id: &str) -> ChatResult<&str> {
    let trimmed = customer_id.trim();
    if trimmed.is_empty() {
        return Err(ChatError::validation("customerId is required"));
    }
    let valid = CUSTOMER_ID
        .as_ref()
        .map(|re| re.is_match(trimmed))
        .unwrap_or(false);
    if !valid {
        return Err(ChatError::validation(format!(
            "customerId `{trimmed}` contains unsupported characters"
        )));
    }
    Ok(trimmed)
}

/// Splits a channel id back into `(topic, customerId)`.
pub fn parse_channel_id(channel_id: &str) -> ChatResult<(Topic, String)> {
    for topic in Topic::ALL {
        if let Some(customer_id) = channel_id.strip_prefix(topic.channel_prefix()) {
            let customer_id = validate_customer_id(customer_id)?;
            return Ok((topic, customer_id.to_string()));
        }
    }
    Err(ChatError::validation(format!(
        "malformed channel id `{channel_id}`"
    )))
}

pub fn topic_of(channel_id: &str) -> Option<Topic> {
    Topic::ALL
        .into_iter()
        .find(|topic| channel_id.starts_with(topic.channel_prefix()))
}

pub fn role_may_access(role: Role, topic: Topic) -> bool {
    POLICY.iter().any(|(r, t)| *r == role && *t == topic)
}

/// Gate for subscribe, publish and history on one channel.
pub fn authorize_channel(identity: &Identity, topic: Topic, customer_id: &str) -> ChatResult<()> {
    if !role_may_access(identity.role, topic) {
        return Err(ChatError::authorization(format!(
            "{} may not access {} channels",
            identity.role, topic
        )));
    }
    if identity.role == Role::Customer && identity.user_id != customer_id.trim() {
        return Err(ChatError::authorization(
            "customers may only access their own channels",
        ));
    }
    Ok(())
}

/// Gate for operator-only operations (read receipts, deletion).
pub fn authorize_operator(identity: &Identity, topic: Topic) -> ChatResult<()> {
    if !identity.role.is_operator() || !role_may_access(identity.role, topic) {
        return Err(ChatError::authorization(format!(
            "{} may not manage {} conversations",
            identity.role, topic
        )));
    }
    Ok(())
}

/// Gate for the directory listing. `all` is admin-only.
pub fn authorize_filter(identity: &Identity, filter: TopicFilter) -> ChatResult<()> {
    match filter {
        TopicFilter::All if identity.role == Role::Admin => Ok(()),
        TopicFilter::All => Err(ChatError::authorization(
            "only admins may list every topic",
        )),
        TopicFilter::Support => authorize_operator(identity, Topic::Support),
        TopicFilter::Consultant => authorize_operator(identity, Topic::Consultant),
    }
}

/// The broadest filter a role may see; what dashboards get by default.
pub fn default_filter(role: Role) -> Option<TopicFilter> {
    match role {
        Role::Admin => Some(TopicFilter::All),
        Role::Support => Some(TopicFilter::Support),
        Role::Consultant => Some(TopicFilter::Consultant),
        Role::Customer => None,
    }
}
