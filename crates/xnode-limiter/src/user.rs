//! Users and their limits.

use std::borrow::Borrow;

use derive_more::{AsRef, Display, From};

/// A user identifier, as assigned by the management panel.
pub type Uid = u64;

/// The name under which a user is known to the proxy engine.
///
/// This is `tag|email|uid`: the same email can be provisioned on several
/// inbounds, and the panel may reuse an email for a new uid.
#[derive(Clone, Debug, Display, AsRef, From, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[as_ref(str)]
pub struct UserKey(String);

impl UserKey {
    /// Build the key of the user `email`/`uid` on the inbound `tag`.
    pub fn new(tag: &str, email: &str, uid: Uid) -> Self {
        UserKey(format!("{}|{}|{}", tag, email, uid))
    }

    /// Return this key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for UserKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The static limits of one user on one inbound.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub struct UserLimit {
    /// The panel's identifier for the user.
    pub uid: Uid,
    /// The user's email.
    pub email: String,
    /// How many distinct source addresses the user may connect from at
    /// once.  Zero means no limit.
    pub device_limit: u32,
    /// The user's speed limit in bytes per second.  Zero means unset.
    pub speed_limit: u64,
}

impl UserLimit {
    /// Construct a new `UserLimit`.
    pub fn new(uid: Uid, email: impl Into<String>, device_limit: u32, speed_limit: u64) -> Self {
        UserLimit {
            uid,
            email: email.into(),
            device_limit,
            speed_limit,
        }
    }

    /// Return the key of this user on `tag`.
    pub fn key(&self, tag: &str) -> UserKey {
        UserKey::new(tag, &self.email, self.uid)
    }
}

/// Combine a node-wide speed limit with a user's own speed limit.
///
/// Zero means "unset" on both sides: if either is zero the result is the
/// other one, so the result is zero (unlimited) only if both are.
/// Otherwise the node limit caps the user limit.
pub fn compose_limit(node: u64, user: u64) -> u64 {
    match (node, user) {
        (0, user) => user,
        (node, 0) => node,
        (node, user) => node.min(user),
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compose_examples() {
        assert_eq!(compose_limit(0, 0), 0);
        assert_eq!(compose_limit(10, 0), 10);
        assert_eq!(compose_limit(0, 7), 7);
        assert_eq!(compose_limit(10, 7), 7);
        assert_eq!(compose_limit(5, 7), 5);
    }

    #[test]
    fn key_format() {
        let u = UserLimit::new(42, "a@example.com", 2, 0);
        assert_eq!(u.key("Vless_443_7").as_str(), "Vless_443_7|a@example.com|42");
        assert_eq!(u.key("t").to_string(), "t|a@example.com|42");
    }

    proptest! {
        #[test]
        fn compose_bounded(node in any::<u64>(), user in any::<u64>()) {
            let r = compose_limit(node, user);
            prop_assert!(r <= node.max(user));
            prop_assert_eq!(r == 0, node == 0 && user == 0);
            if node > 0 && user > 0 {
                prop_assert_eq!(r, node.min(user));
            }
        }

        #[test]
        fn compose_is_symmetric(node in any::<u64>(), user in any::<u64>()) {
            prop_assert_eq!(compose_limit(node, user), compose_limit(user, node));
        }
    }
}
