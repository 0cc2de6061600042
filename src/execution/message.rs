//! Messages exchanged on the edges between superstep stages

use crate::error::Result;
use crate::record::Record;

/// A batch of records as it travels over an edge
#[derive(Debug, Clone)]
pub enum Payload {
    /// Records handed over by value
    Local(Vec<Record>),
    /// Records serialized for a network edge
    Encoded(Vec<Vec<u8>>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Self::Local(records) => records.len(),
            Self::Encoded(frames) => frames.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(records: Vec<Record>) -> Result<Self> {
        let frames = records
            .iter()
            .map(Record::encode)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::Encoded(frames))
    }

    pub fn into_records(self) -> Result<Vec<Record>> {
        match self {
            Self::Local(records) => Ok(records),
            Self::Encoded(frames) => frames.iter().map(|frame| Record::decode(frame)).collect(),
        }
    }
}

/// Edge traffic: record batches, superstep boundaries and the final shutdown
#[derive(Debug, Clone)]
pub enum StageMessage {
    Batch(Payload),
    /// The sender has emitted everything it will emit for `superstep`
    EndOfSuperstep { superstep: u32, sender: usize },
    /// The scope terminated; no further supersteps follow
    Terminate { sender: usize },
}

impl StageMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::EndOfSuperstep { .. } => "end_of_superstep",
            Self::Terminate { .. } => "terminate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_payload_decodes_to_same_records() {
        let records = vec![Record::pair(1, 2), Record::pair(-3, 4)];
        let payload = Payload::encode(records.clone()).unwrap();
        assert!(matches!(payload, Payload::Encoded(_)));
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.into_records().unwrap(), records);
    }

    #[test]
    fn test_corrupt_frame_is_a_codec_error() {
        let payload = Payload::Encoded(vec![b"not json".to_vec()]);
        assert!(matches!(
            payload.into_records(),
            Err(crate::error::IterationError::Codec { .. })
        ));
    }
}
