// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The protocol's message vocabulary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ModelError, ParseError};
use crate::id::Token;
use crate::value::{Constraint, Value};
use crate::when::When;

/// The verb of a capability that performs an active measurement.
pub const VERB_MEASURE: &str = "measure";
/// The verb of a capability that answers a query over stored data.
pub const VERB_QUERY: &str = "query";

/// An advertised, invocable operation.
///
/// A capability declares the constraint each of its parameters must satisfy
/// and the names of the values its results carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// What the capability does, e.g. [`VERB_MEASURE`].
    pub verb: String,
    /// A human-readable name. Not necessarily unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// When the capability is available.
    pub when: When,
    /// The constraint on each parameter, by name.
    #[serde(default)]
    pub parameters: BTreeMap<String, Constraint>,
    /// The names of the values a result carries.
    #[serde(default)]
    pub results: BTreeSet<String>,
    /// Free-form metadata describing the capability.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// Where to send specifications for this capability, if not to the peer
    /// that advertised it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Capability {
    /// Constructs a capability with no parameters or results.
    pub fn new(verb: impl Into<String>, when: When) -> Capability {
        Capability {
            verb: verb.into(),
            label: None,
            when,
            parameters: BTreeMap::new(),
            results: BTreeSet::new(),
            metadata: BTreeMap::new(),
            link: None,
        }
    }

    /// Sets the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Capability {
        self.label = Some(label.into());
        self
    }

    /// Declares a parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, constraint: Constraint) -> Capability {
        self.parameters.insert(name.into(), constraint);
        self
    }

    /// Declares a result value.
    pub fn with_result(mut self, name: impl Into<String>) -> Capability {
        self.results.insert(name.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Capability {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the link.
    pub fn with_link(mut self, link: impl Into<String>) -> Capability {
        self.link = Some(link.into());
        self
    }

    /// The capability's token.
    ///
    /// Derived from everything that describes the capability, and kept in a
    /// separate domain from invocation tokens.
    pub fn token(&self) -> Token {
        let parameters: serde_json::Map<_, _> = self
            .parameters
            .iter()
            .map(|(name, c)| (name.clone(), serde_json::Value::String(c.to_string())))
            .collect();
        let metadata: serde_json::Map<_, _> = self
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), canonical_value(v)))
            .collect();
        Token::digest(&json!({
            "domain": "capability",
            "verb": self.verb,
            "label": self.label,
            "when": self.when.to_string(),
            "parameters": parameters,
            "results": self.results,
            "metadata": metadata,
            "link": self.link,
        }))
    }

    /// Reports whether `other` has the same verb, parameter names and
    /// result names as this capability.
    pub fn same_schema(&self, other: &Capability) -> bool {
        self.verb == other.verb
            && self.parameters.keys().eq(other.parameters.keys())
            && self.results == other.results
    }
}

/// Returns every capability among `candidates` whose schema matches `capability`
/// and whose constraints are each a superset of the corresponding constraint
/// of `capability`.
///
/// Used to match a withdrawal whose token is not known exactly.
pub fn capabilities_matching_schema<'a, I>(
    candidates: I,
    capability: &Capability,
) -> Vec<&'a Capability>
where
    I: IntoIterator<Item = &'a Capability>,
{
    candidates
        .into_iter()
        .filter(|candidate| {
            candidate.same_schema(capability)
                && candidate
                    .parameters
                    .iter()
                    .zip(capability.parameters.values())
                    .all(|((_, mine), theirs)| mine.is_superset_of(theirs))
        })
        .collect()
}

/// A capability bound to concrete parameter values and a concrete temporal
/// scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    /// The verb of the originating capability.
    pub verb: String,
    /// A human-readable name, usually the capability's label with a serial
    /// suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// When to run.
    pub when: When,
    /// The value of each parameter, by name.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// The names of the values the result must carry.
    #[serde(default)]
    pub results: BTreeSet<String>,
}

impl Specification {
    /// Binds `capability` to `parameters` and `when`.
    ///
    /// Parameters the capability constrains to a single value may be
    /// omitted. The label defaults to the capability's.
    pub fn from_capability(
        capability: &Capability,
        when: When,
        mut parameters: BTreeMap<String, Value>,
        label: Option<String>,
    ) -> Result<Specification, ModelError> {
        if let Some(unknown) = parameters
            .keys()
            .find(|name| !capability.parameters.contains_key(*name))
        {
            return Err(ModelError::UnknownParameter(unknown.clone()));
        }
        for (name, constraint) in &capability.parameters {
            if !parameters.contains_key(name) {
                let Some(value) = constraint.single_value() else {
                    return Err(ModelError::MissingParameter(name.clone()));
                };
                parameters.insert(name.clone(), value.clone());
            }
            let value = &parameters[name];
            if !constraint.contains(value) {
                return Err(ModelError::ConstraintViolation {
                    name: name.clone(),
                    value: value.clone(),
                    constraint: constraint.to_string(),
                });
            }
        }
        if let When::Span { start, end } = when {
            When::span(start, end)?;
        }
        Ok(Specification {
            verb: capability.verb.clone(),
            label: label.or_else(|| capability.label.clone()),
            when,
            parameters,
            results: capability.results.clone(),
        })
    }

    /// The specification's token.
    ///
    /// Derived from the capability schema, the parameter values and the
    /// temporal scope. The label does not contribute.
    pub fn token(&self) -> Token {
        let parameters: serde_json::Map<_, _> = self
            .parameters
            .iter()
            .map(|(name, v)| (name.clone(), canonical_value(v)))
            .collect();
        Token::digest(&json!({
            "domain": "specification",
            "verb": self.verb,
            "parameters": parameters,
            "results": self.results,
            "when": self.when.to_string(),
        }))
    }

    /// Reports whether this specification is a valid invocation of
    /// `capability`.
    ///
    /// True iff the verb and the parameter and result name sets match
    /// exactly and every parameter value satisfies its constraint. Never
    /// fails; a mismatch is simply `false`.
    pub fn fulfills(&self, capability: &Capability) -> bool {
        self.verb == capability.verb
            && self.results == capability.results
            && self.parameters.keys().eq(capability.parameters.keys())
            && self
                .parameters
                .values()
                .zip(capability.parameters.values())
                .all(|(value, constraint)| constraint.contains(value))
    }
}

/// Values that compare equal have the same canonical form, so a real with
/// no fractional part is written as an integer.
#[allow(clippy::as_conversions)]
fn canonical_value(v: &Value) -> serde_json::Value {
    // 2^64 and -2^63, exactly representable as f64.
    const NATURAL_LIMIT: f64 = 18_446_744_073_709_551_616.0;
    const INTEGER_FLOOR: f64 = -9_223_372_036_854_775_808.0;
    match v {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Natural(n) => serde_json::Value::from(*n),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) if f.fract() == 0.0 && (0.0..NATURAL_LIMIT).contains(f) => {
            serde_json::Value::from(*f as u64)
        }
        Value::Real(f) if f.fract() == 0.0 && (INTEGER_FLOOR..0.0).contains(f) => {
            serde_json::Value::from(*f as i64)
        }
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Text(s) => serde_json::Value::String(s.clone()),
    }
}

/// Acknowledges that a specification was accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// The token of the accepted specification.
    pub token: Token,
    /// The label of the accepted specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// The temporal scope of the accepted specification.
    pub when: When,
}

impl Receipt {
    /// Constructs the receipt for `spec`.
    pub fn for_specification(spec: &Specification) -> Receipt {
        Receipt {
            token: spec.token(),
            label: spec.label.clone(),
            when: spec.when,
        }
    }
}

/// Asks for the result of a previously receipted specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    /// The token of the specification.
    pub token: Token,
    /// The label of the specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Redemption {
    /// Constructs the redemption of `receipt`.
    pub fn for_receipt(receipt: &Receipt) -> Redemption {
        Redemption {
            token: receipt.token.clone(),
            label: receipt.label.clone(),
        }
    }
}

/// The values produced by a specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// The token of the specification.
    pub token: Token,
    /// The label of the specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// The interval actually covered, possibly narrower than requested.
    pub when: When,
    /// The value of each declared result, by name.
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl ResultMessage {
    /// Constructs an empty result for `spec` covering `when`.
    pub fn for_specification(spec: &Specification, when: When) -> ResultMessage {
        ResultMessage {
            token: spec.token(),
            label: spec.label.clone(),
            when,
            values: BTreeMap::new(),
        }
    }

    /// Sets a result value.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> ResultMessage {
        self.values.insert(name.into(), value.into());
        self
    }
}

/// An error reported to a peer in place of a receipt or result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolException {
    /// The token the error concerns, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    /// A human-readable description of the error.
    pub message: String,
}

impl ProtocolException {
    /// Constructs an exception.
    pub fn new(token: Option<Token>, message: impl Into<String>) -> ProtocolException {
        ProtocolException {
            token,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProtocolException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(f, "{} (token {})", self.message, token),
            None => f.write_str(&self.message),
        }
    }
}

/// Retracts a previously advertised capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Withdrawal {
    /// The capability being withdrawn.
    pub capability: Capability,
}

impl Withdrawal {
    /// Constructs the withdrawal of `capability`.
    pub fn new(capability: Capability) -> Withdrawal {
        Withdrawal { capability }
    }

    /// The token of the withdrawn capability.
    pub fn token(&self) -> Token {
        self.capability.token()
    }
}

/// Requests early termination of a pending or running specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    /// The token of the specification.
    pub token: Token,
    /// The label of the specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// An ordered batch of messages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// The batched messages, in order.
    pub messages: Vec<Message>,
}

impl Envelope {
    /// Flattens this envelope and any envelopes nested inside it into a
    /// single ordered list of messages.
    pub fn flatten(self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len());
        let mut stack: Vec<_> = self.messages.into_iter().rev().collect();
        while let Some(message) = stack.pop() {
            match message {
                Message::Envelope(inner) => stack.extend(inner.messages.into_iter().rev()),
                message => out.push(message),
            }
        }
        out
    }
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// See [`Capability`].
    Capability(Capability),
    /// See [`Specification`].
    Specification(Specification),
    /// See [`Receipt`].
    Receipt(Receipt),
    /// See [`Redemption`].
    Redemption(Redemption),
    /// See [`ResultMessage`].
    Result(ResultMessage),
    /// See [`ProtocolException`].
    Exception(ProtocolException),
    /// See [`Withdrawal`].
    Withdrawal(Withdrawal),
    /// See [`Interrupt`].
    Interrupt(Interrupt),
    /// See [`Envelope`].
    Envelope(Envelope),
}

impl Message {
    /// A short name for the kind of message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Capability(_) => "capability",
            Message::Specification(_) => "specification",
            Message::Receipt(_) => "receipt",
            Message::Redemption(_) => "redemption",
            Message::Result(_) => "result",
            Message::Exception(_) => "exception",
            Message::Withdrawal(_) => "withdrawal",
            Message::Interrupt(_) => "interrupt",
            Message::Envelope(_) => "envelope",
        }
    }

    /// The token of the message, if it has one.
    pub fn token(&self) -> Option<Token> {
        match self {
            Message::Capability(c) => Some(c.token()),
            Message::Specification(s) => Some(s.token()),
            Message::Receipt(r) => Some(r.token.clone()),
            Message::Redemption(r) => Some(r.token.clone()),
            Message::Result(r) => Some(r.token.clone()),
            Message::Exception(e) => e.token.clone(),
            Message::Withdrawal(w) => Some(w.token()),
            Message::Interrupt(i) => Some(i.token.clone()),
            Message::Envelope(_) => None,
        }
    }

    /// Parses a message from its JSON form.
    pub fn from_json(json: &str) -> Result<Message, ParseError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Renders this message in its JSON form.
    pub fn to_json(&self) -> Result<String, ParseError> {
        Ok(serde_json::to_string(self)?)
    }
}

macro_rules! impl_from_for_message {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                fn from(m: $ty) -> Message {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_from_for_message!(
    Capability => Capability,
    Specification => Specification,
    Receipt => Receipt,
    Redemption => Redemption,
    ResultMessage => Result,
    ProtocolException => Exception,
    Withdrawal => Withdrawal,
    Interrupt => Interrupt,
    Envelope => Envelope,
);

/// The reply to a dispatched message.
///
/// Peer-visible failures are [`Reply::Exception`] values, never Rust errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The specification was accepted and its result is not yet available.
    Receipt(Receipt),
    /// The specification's result.
    Result(ResultMessage),
    /// The message could not be honored, or the specification failed.
    Exception(ProtocolException),
    /// The interrupt was applied.
    Interrupted(Interrupt),
    /// One reply per message of a dispatched envelope, in order.
    Envelope(Vec<Reply>),
}

impl Reply {
    /// Constructs an exception reply.
    pub fn exception(token: Option<Token>, message: impl Into<String>) -> Reply {
        Reply::Exception(ProtocolException::new(token, message))
    }

    /// Reports whether this reply is a final outcome for its token.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Reply::Result(_) | Reply::Exception(_))
    }

    /// The token the reply concerns, if any.
    pub fn token(&self) -> Option<&Token> {
        match self {
            Reply::Receipt(r) => Some(&r.token),
            Reply::Result(r) => Some(&r.token),
            Reply::Exception(e) => e.token.as_ref(),
            Reply::Interrupted(i) => Some(&i.token),
            Reply::Envelope(_) => None,
        }
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Message {
        match reply {
            Reply::Receipt(r) => Message::Receipt(r),
            Reply::Result(r) => Message::Result(r),
            Reply::Exception(e) => Message::Exception(e),
            Reply::Interrupted(i) => Message::Interrupt(i),
            Reply::Envelope(replies) => Message::Envelope(Envelope {
                messages: replies.into_iter().map(Message::from).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::when::{End, Start};

    use super::*;

    fn ping() -> Capability {
        Capability::new(VERB_MEASURE, When::span(Start::Now, End::Future).unwrap())
            .with_label("ping-average-ip4")
            .with_parameter("source.ip4", "10.0.27.2".parse().unwrap())
            .with_parameter("destination.ip4", Constraint::Any)
            .with_parameter("period.s", "1 ... 60".parse().unwrap())
            .with_result("delay.twoway.icmp.us.mean")
    }

    fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn from_capability_fills_and_validates() {
        let cap = ping();
        let spec = Specification::from_capability(
            &cap,
            When::Immediate,
            params(&[
                ("destination.ip4", "10.0.37.2".into()),
                ("period.s", Value::Natural(5)),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(spec.parameters["source.ip4"], Value::from("10.0.27.2"));
        assert_eq!(spec.label.as_deref(), Some("ping-average-ip4"));
        assert!(spec.fulfills(&cap));

        let missing = Specification::from_capability(
            &cap,
            When::Immediate,
            params(&[("period.s", Value::Natural(5))]),
            None,
        );
        assert_eq!(
            missing,
            Err(ModelError::MissingParameter("destination.ip4".into()))
        );

        let violation = Specification::from_capability(
            &cap,
            When::Immediate,
            params(&[
                ("destination.ip4", "10.0.37.2".into()),
                ("period.s", Value::Natural(61)),
            ]),
            None,
        );
        assert!(matches!(
            violation,
            Err(ModelError::ConstraintViolation { name, .. }) if name == "period.s"
        ));

        let unknown = Specification::from_capability(
            &cap,
            When::Immediate,
            params(&[("colour", "red".into())]),
            None,
        );
        assert_eq!(unknown, Err(ModelError::UnknownParameter("colour".into())));
    }

    #[test]
    fn fulfills_is_strict() {
        let cap = ping();
        let spec = Specification::from_capability(
            &cap,
            When::Immediate,
            params(&[
                ("destination.ip4", "10.0.37.2".into()),
                ("period.s", Value::Natural(5)),
            ]),
            Some("relabeled".into()),
        )
        .unwrap();
        assert!(spec.fulfills(&cap));

        let mut bad_value = spec.clone();
        bad_value
            .parameters
            .insert("source.ip4".into(), "10.0.27.3".into());
        assert!(!bad_value.fulfills(&cap));

        let mut extra = spec.clone();
        extra.parameters.insert("ttl".into(), Value::Natural(3));
        assert!(!extra.fulfills(&cap));

        let mut other_results = spec.clone();
        other_results.results.insert("loss.ratio".into());
        assert!(!other_results.fulfills(&cap));

        let mut other_verb = spec;
        other_verb.verb = VERB_QUERY.into();
        assert!(!other_verb.fulfills(&cap));
    }

    #[test]
    fn tokens_ignore_labels_but_not_scope() {
        let cap = ping();
        let values = params(&[
            ("destination.ip4", "10.0.37.2".into()),
            ("period.s", Value::Natural(5)),
        ]);
        let a = Specification::from_capability(&cap, When::Immediate, values.clone(), None).unwrap();
        let b = Specification::from_capability(&cap, When::Immediate, values.clone(), Some("x".into()))
            .unwrap();
        assert_eq!(a.token(), b.token());

        let later = When::span(Start::At(1_000), End::At(2_000)).unwrap();
        let c = Specification::from_capability(&cap, later, values, None).unwrap();
        assert_ne!(a.token(), c.token());

        // Capability tokens live in a different domain.
        assert_ne!(cap.token(), a.token());
        assert_ne!(cap.token(), cap.clone().with_label("other").token());
    }

    #[test]
    fn equal_numbers_give_equal_tokens() {
        let cap = ping();
        let spec = |period: Value| {
            let values = params(&[
                ("destination.ip4", "10.0.37.2".into()),
                ("period.s", period),
            ]);
            Specification::from_capability(&cap, When::Immediate, values, None).unwrap()
        };
        let natural = spec(Value::Natural(4));
        let integer = spec(Value::Integer(4));
        let real = spec(Value::Real(4.0));
        assert_eq!(natural, real);
        assert_eq!(natural.token(), integer.token());
        assert_eq!(natural.token(), real.token());
        assert_ne!(natural.token(), spec(Value::Real(4.5)).token());

        // Negative zero is zero.
        let negative = ping().with_parameter("period.s", "-10 ... 10".parse().unwrap());
        let spec = |period: Value| {
            let values = params(&[
                ("destination.ip4", "10.0.37.2".into()),
                ("period.s", period),
            ]);
            Specification::from_capability(&negative, When::Immediate, values, None).unwrap()
        };
        assert_eq!(spec(Value::Real(-0.0)).token(), spec(Value::Natural(0)).token());
        assert_eq!(spec(Value::Real(-3.0)).token(), spec(Value::Integer(-3)).token());
    }

    #[test]
    fn schema_matching() {
        let narrow = ping();
        let wide = ping().with_parameter("period.s", Constraint::Any);
        let other = ping().with_result("loss.ratio");
        let caps = vec![narrow.clone(), wide.clone(), other];

        let matches = capabilities_matching_schema(&caps, &narrow);
        assert_eq!(matches, vec![&narrow, &wide]);
        let matches = capabilities_matching_schema(&caps, &wide);
        assert_eq!(matches, vec![&wide]);
    }

    #[test]
    fn envelopes_flatten_in_order() {
        let interrupt = |t: &str| {
            Message::Interrupt(Interrupt {
                token: t.into(),
                label: None,
            })
        };
        let envelope = Envelope {
            messages: vec![
                interrupt("a"),
                Message::Envelope(Envelope {
                    messages: vec![interrupt("b"), Message::Envelope(Envelope::default())],
                }),
                interrupt("c"),
            ],
        };
        let tokens: Vec<_> = envelope
            .flatten()
            .iter()
            .filter_map(Message::token)
            .collect();
        assert_eq!(tokens, vec![Token::from("a"), "b".into(), "c".into()]);
    }

    #[test]
    fn json_codec() {
        let cap = ping();
        let json = Message::from(cap.clone()).to_json().unwrap();
        assert!(json.contains(r#""kind":"capability""#));
        assert!(json.contains(r#""when":"now ... future""#));
        assert!(json.contains(r#""period.s":"1 ... 60""#));
        assert_eq!(Message::from_json(&json).unwrap(), Message::Capability(cap));

        let withdrawal = Message::from_json(
            r#"{"kind": "withdrawal", "verb": "measure", "when": "now", "parameters": {"a": "*"}}"#,
        )
        .unwrap();
        assert!(matches!(withdrawal, Message::Withdrawal(w) if w.capability.parameters["a"] == Constraint::Any));

        assert!(matches!(
            Message::from_json(r#"{"kind": "receipt", "token": "t", "when": "soon"}"#),
            Err(ParseError::Json(_))
        ));
        assert!(Message::from_json(r#"{"kind": "telegram"}"#).is_err());
        assert!(Message::from_json("not json").is_err());
    }

    proptest! {
        #[test]
        fn token_determinism(
            period in 1u64..=60,
            dest in "[a-z]{1,8}",
            reverse in any::<bool>(),
            bump in 1u64..10,
        ) {
            let cap = ping();
            let mut pairs = vec![
                ("destination.ip4".to_string(), Value::from(dest.clone())),
                ("period.s".to_string(), Value::Natural(period)),
            ];
            if reverse {
                pairs.reverse();
            }
            let a = Specification::from_capability(&cap, When::Immediate, pairs.into_iter().collect(), None).unwrap();
            let b = Specification::from_capability(
                &cap,
                When::Immediate,
                params(&[("period.s", Value::Natural(period)), ("destination.ip4", dest.as_str().into())]),
                None,
            ).unwrap();
            prop_assert_eq!(a.token(), b.token());

            let mut changed = a.clone();
            changed.parameters.insert("period.s".into(), Value::Natural(period + bump));
            prop_assert_ne!(a.token(), changed.token());
        }
    }
}
