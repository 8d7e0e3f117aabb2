//! Helpers over `hickory-proto` messages.
//!
//! Sections are flat record lists; an rrset is a contiguous run of records
//! sharing owner, type and class, which is how every stage in this workspace
//! builds them.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

/// Coarse classification of a response, used by the resolver stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCategory {
    /// Answer section is not empty.
    Answer,
    /// Name does not exist.
    NxDomain,
    /// Name exists but has no data of the queried type.
    NxRrset,
    /// Delegation to more specific nameservers.
    Referral,
    /// Anything else (SERVFAIL, REFUSED, ...).
    Invalid,
}

/// Classifies a response.
pub fn classify_response(msg: &Message) -> ResponseCategory {
    match msg.response_code() {
        ResponseCode::NXDomain => return ResponseCategory::NxDomain,
        ResponseCode::NoError => {}
        _ => return ResponseCategory::Invalid,
    }

    if !msg.answers().is_empty() {
        return ResponseCategory::Answer;
    }

    let authority = msg.name_servers();
    let has_ns = authority.iter().any(|r| r.record_type() == RecordType::NS);
    let has_soa = authority.iter().any(|r| r.record_type() == RecordType::SOA);
    if has_ns && !has_soa {
        ResponseCategory::Referral
    } else {
        ResponseCategory::NxRrset
    }
}

/// Returns the index ranges of the rrsets in a section.
pub fn rrset_ranges(records: &[Record]) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    for (i, record) in records.iter().enumerate() {
        match ranges.last_mut() {
            Some(range) if same_rrset(&records[range.start], record) => range.end = i + 1,
            _ => ranges.push(i..i + 1),
        }
    }
    ranges
}

/// Number of rrsets in a section.
pub fn rrset_count(records: &[Record]) -> usize {
    rrset_ranges(records).len()
}

fn same_rrset(a: &Record, b: &Record) -> bool {
    a.record_type() == b.record_type() && a.dns_class() == b.dns_class() && a.name() == b.name()
}

/// Rotates every multi-record rrset of the answer section by one position.
pub fn rotate_answers(msg: &mut Message) {
    let mut answers = msg.take_answers();
    for range in rrset_ranges(&answers) {
        if range.len() > 1 {
            answers[range].rotate_left(1);
        }
    }
    msg.insert_answers(answers);
}

/// Keeps only the first rrset of the answer section.
pub fn truncate_answers_to_first_rrset(msg: &mut Message) {
    let mut answers = msg.take_answers();
    if let Some(range) = rrset_ranges(&answers).into_iter().next() {
        answers.truncate(range.end);
    }
    msg.insert_answers(answers);
}

/// Target of a CNAME record.
pub fn cname_target(record: &Record) -> Option<&Name> {
    match record.data() {
        Some(RData::CNAME(cname)) => Some(&cname.0),
        _ => None,
    }
}

/// Target of an NS record.
pub fn ns_target(record: &Record) -> Option<&Name> {
    match record.data() {
        Some(RData::NS(ns)) => Some(&ns.0),
        _ => None,
    }
}

/// 32-bit hash of the lowercased name.
pub fn name_hash(name: &Name) -> u32 {
    let mut hasher = DefaultHasher::new();
    name.to_lowercase().hash(&mut hasher);
    hasher.finish() as u32
}

/// Builds an empty response mirroring the request header and question.
pub fn make_response(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired());
    response.add_queries(request.queries().iter().cloned());
    response
}

/// Builds an error response with the given code.
pub fn error_response(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = make_response(request);
    response.set_response_code(rcode);
    response
}
