// Method command implementations
//
// Line tables map bytecode positions to source lines.

use serde::{Deserialize, Serialize};

use crate::codec::{JdwpDecode, JdwpReader};
use crate::commands::{command_sets, method_commands};
use crate::protocol::JdwpResult;
use crate::session::Session;
use crate::types::{MethodId, ReferenceTypeId};

/// Line table entry - maps source line to bytecode index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTableEntry {
    pub line_code_index: u64, // bytecode index
    pub line_number: i32,     // source line number
}

impl JdwpDecode for LineTableEntry {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(LineTableEntry {
            line_code_index: r.get_u64()?,
            line_number: r.get_i32()?,
        })
    }
}

/// Complete line table for a method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTable {
    pub start: u64, // starting bytecode index
    pub end: u64,   // ending bytecode index
    pub lines: Vec<LineTableEntry>,
}

impl JdwpDecode for LineTable {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(LineTable {
            start: r.get_u64()?,
            end: r.get_u64()?,
            lines: r.get()?,
        })
    }
}

impl LineTable {
    /// Source line containing the given bytecode index.
    pub fn line_for_index(&self, index: u64) -> Option<i32> {
        if index < self.start || index > self.end {
            return None;
        }
        self.lines
            .iter()
            .filter(|entry| entry.line_code_index <= index)
            .max_by_key(|entry| entry.line_code_index)
            .map(|entry| entry.line_number)
    }
}

impl Session {
    /// Get line table for a method (Method.LineTable command)
    pub async fn get_line_table(
        &self,
        ref_type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> JdwpResult<LineTable> {
        self.send_command(
            command_sets::METHOD,
            method_commands::LINE_TABLE,
            &(ref_type_id, method_id),
        )
        .await
    }
}
