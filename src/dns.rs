///! DNS front/back ends (C9): question construction for the client, question
///! parsing and answer shuttling for the server.
///!
///! Wire parsing/encoding itself is delegated entirely to `hickory-proto`;
///! this module only knows how to turn a tunnel request into a `TXT`
///! question, and a tunnel response into a `TXT` (or `NS`) answer.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{NS, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::error::{Result, TunnelError};

fn proto_err(context: &str, e: impl std::fmt::Display) -> TunnelError {
    TunnelError::Transport(format!("{context}: {e}"))
}

/// Build a `TXT` question for `fqdn` (already including the tunnel domain)
/// with a random transaction ID, returning the wire bytes and the ID chosen
/// (callers match responses against it).
pub fn build_txt_query(fqdn: &str) -> Result<(Vec<u8>, u16)> {
    let name = Name::from_ascii(fqdn).map_err(|e| proto_err("invalid fqdn", e))?;

    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(RecordType::TXT);
    query.set_query_class(DNSClass::IN);

    let id: u16 = rand::random();
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);

    let bytes = message
        .to_bytes()
        .map_err(|e| proto_err("failed to encode query", e))?;
    Ok((bytes, id))
}

/// Extract the transaction ID and first question (name, qtype) from a raw
/// DNS query packet.
pub struct ParsedQuery {
    pub id: u16,
    pub name: String,
    pub qtype: RecordType,
}

pub fn parse_query(packet: &[u8]) -> Result<ParsedQuery> {
    let message =
        Message::from_bytes(packet).map_err(|e| proto_err("failed to decode query", e))?;

    let query = message
        .queries()
        .first()
        .ok_or_else(|| TunnelError::Decode("query had no question section".to_string()))?;

    Ok(ParsedQuery {
        id: message.id(),
        name: query.name().to_string(),
        qtype: query.query_type(),
    })
}

/// Build a `TXT` response carrying `txt` as the answer's single string,
/// replying to question `name` with transaction ID `id`.
pub fn build_txt_response(id: u16, name: &str, txt: &str) -> Result<Vec<u8>> {
    let parsed_name = Name::from_ascii(name).map_err(|e| proto_err("invalid name", e))?;

    let mut query = Query::new();
    query.set_name(parsed_name.clone());
    query.set_query_type(RecordType::TXT);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    message.set_response_code(ResponseCode::NoError);
    message.add_query(query);

    let record = Record::from_rdata(parsed_name, 60, RData::TXT(TXT::new(vec![txt.to_string()])));
    message.add_answer(record);

    message
        .to_bytes()
        .map_err(|e| proto_err("failed to encode txt response", e))
}

/// Build an `NS` response naming `nameserver` as the authority for `name`.
pub fn build_ns_response(id: u16, name: &str, nameserver: &str) -> Result<Vec<u8>> {
    let parsed_name = Name::from_ascii(name).map_err(|e| proto_err("invalid name", e))?;
    let ns_name = Name::from_ascii(nameserver).map_err(|e| proto_err("invalid nameserver", e))?;

    let mut query = Query::new();
    query.set_name(parsed_name.clone());
    query.set_query_type(RecordType::NS);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    message.set_response_code(ResponseCode::NoError);
    message.add_query(query);

    let record = Record::from_rdata(parsed_name, 3600, RData::NS(NS(ns_name)));
    message.add_answer(record);

    message
        .to_bytes()
        .map_err(|e| proto_err("failed to encode ns response", e))
}

/// Parse a raw DNS response packet and return its transaction ID alongside
/// the first string of its first `TXT` answer.
pub fn first_txt_answer_with_id(packet: &[u8]) -> Result<(u16, String)> {
    let message =
        Message::from_bytes(packet).map_err(|e| proto_err("failed to decode response", e))?;

    let answer = message
        .answers()
        .first()
        .ok_or_else(|| TunnelError::Transport("response had no answers".to_string()))?;

    let txt_string = match answer.data() {
        Some(RData::TXT(txt)) => {
            let first = txt
                .txt_data()
                .first()
                .ok_or_else(|| TunnelError::Transport("empty txt response".to_string()))?;
            String::from_utf8(first.to_vec()).map_err(|e| proto_err("txt answer not utf-8", e))?
        }
        _ => {
            return Err(TunnelError::Transport(
                "answer was not a txt record".to_string(),
            ))
        }
    };

    Ok((message.id(), txt_string))
}

/// Parse a raw DNS response packet and return the first string of its first
/// `TXT` answer, discarding the transaction ID.
pub fn first_txt_answer(packet: &[u8]) -> Result<String> {
    first_txt_answer_with_id(packet).map(|(_, txt)| txt)
}
