//! The packed configuration record carried by CONF acts.
//!
//! Layout (little-endian):
//! `seqno:i64, conf_id:i64, group_uuid:[u8;16], st_required:u8,
//! memb_num:i64, my_idx:i64, data:variable`. The `data` region is a
//! sequence of NUL-terminated member ids, each bounded to 40 bytes
//! including the terminator. `conf_id = -1` encodes a non-primary
//! configuration; `my_idx = -1` is legal only when `memb_num = 0`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use starling_types::{ConfId, GroupUuid, MemberId, Seqno};

use crate::error::{WireError, WireResult};

/// Fixed prefix of the record, before the member id region.
const FIXED_LEN: usize = 8 + 8 + 16 + 1 + 8 + 8;

/// Decoded contents of a CONF act payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfRecord {
    /// Global seqno at the moment of this configuration.
    pub seqno: Seqno,

    /// Primary configuration id; `None` when the view lost quorum.
    pub conf_id: Option<ConfId>,

    /// Group identity shared by this history.
    pub group_uuid: GroupUuid,

    /// True if this node must request a state transfer before serving.
    pub st_required: bool,

    /// This node's position in `members`; `None` iff `members` is empty.
    pub my_idx: Option<usize>,

    /// Member ids in group order.
    pub members: Vec<MemberId>,
}

impl ConfRecord {
    /// Encodes the record into its packed wire form.
    pub fn encode(&self) -> WireResult<Bytes> {
        if self.members.is_empty() != self.my_idx.is_none() {
            return Err(WireError::MalformedConf(format!(
                "my_idx {:?} inconsistent with {} members",
                self.my_idx,
                self.members.len()
            )));
        }
        if let Some(idx) = self.my_idx {
            if idx >= self.members.len() {
                return Err(WireError::MalformedConf(format!(
                    "my_idx {idx} out of range for {} members",
                    self.members.len()
                )));
            }
        }

        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.members.len() * 16);
        buf.put_i64_le(self.seqno.as_i64());
        buf.put_i64_le(ConfId::encode_opt(self.conf_id));
        buf.put_slice(self.group_uuid.as_bytes());
        buf.put_u8(u8::from(self.st_required));
        buf.put_i64_le(self.members.len() as i64);
        buf.put_i64_le(self.my_idx.map_or(-1, |idx| idx as i64));

        for member in &self.members {
            let raw = member.as_str().as_bytes();
            if raw.len() + 1 > MemberId::MAX_WIRE_LEN {
                return Err(WireError::MemberIdTooLong { len: raw.len() + 1 });
            }
            if raw.contains(&0) {
                return Err(WireError::MemberIdInteriorNul);
            }
            buf.put_slice(raw);
            buf.put_u8(0);
        }

        Ok(buf.freeze())
    }

    /// Decodes a packed record.
    pub fn decode(payload: &[u8]) -> WireResult<Self> {
        if payload.len() < FIXED_LEN {
            return Err(WireError::Truncated {
                needed: FIXED_LEN,
                got: payload.len(),
            });
        }

        let mut buf = payload;
        let seqno = buf.get_i64_le();
        let conf_id = buf.get_i64_le();
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let st_required = buf.get_u8() != 0;
        let memb_num = buf.get_i64_le();
        let my_idx = buf.get_i64_le();

        let Some(seqno) = Seqno::decode_opt(seqno) else {
            return Err(WireError::MalformedConf(format!(
                "negative configuration seqno {seqno}"
            )));
        };
        if memb_num < 0 {
            return Err(WireError::MalformedConf(format!(
                "negative member count {memb_num}"
            )));
        }
        let memb_num = memb_num as usize;

        let my_idx = match my_idx {
            -1 if memb_num == 0 => None,
            idx if idx >= 0 && (idx as usize) < memb_num => Some(idx as usize),
            idx => {
                return Err(WireError::MalformedConf(format!(
                    "my_idx {idx} out of range for {memb_num} members"
                )))
            }
        };

        let mut members = Vec::with_capacity(memb_num);
        for _ in 0..memb_num {
            let len = buf
                .iter()
                .position(|&b| b == 0)
                .ok_or(WireError::MalformedConf("unterminated member id".into()))?;
            if len + 1 > MemberId::MAX_WIRE_LEN {
                return Err(WireError::MemberIdTooLong { len: len + 1 });
            }
            let id = std::str::from_utf8(&buf[..len])
                .map_err(|e| WireError::MalformedConf(format!("member id not UTF-8: {e}")))?;
            members.push(MemberId::new(id));
            buf.advance(len + 1);
        }

        Ok(Self {
            seqno,
            conf_id: ConfId::decode_opt(conf_id),
            group_uuid: GroupUuid::from_bytes(uuid),
            st_required,
            my_idx,
            members,
        })
    }
}
