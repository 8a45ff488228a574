use bytes::Bytes;

/// Where a file channel is in its name/payload cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    AwaitName,
    AwaitData,
}

/// A file name paired with the payload that followed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub name: String,
    pub data: Bytes,
}

/// Per-peer pairing of file names and payloads.
///
/// The sender writes the filename as a text message and then the whole
/// payload as one binary message, so a file is complete on its first binary
/// message. The channel must be ordered.
#[derive(Debug, Default)]
pub struct FileAssembler {
    name: Option<String>,
}

impl FileAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TransferState {
        if self.name.is_some() {
            TransferState::AwaitData
        } else {
            TransferState::AwaitName
        }
    }

    /// A new name replaces any pending one
    pub fn accept_name(&mut self, name: String) {
        self.name = Some(name);
    }

    /// Returns the completed file, or `None` when no name preceded the chunk
    pub fn accept_chunk(&mut self, chunk: Bytes) -> Option<CompletedFile> {
        let name = self.name.take()?;
        Some(CompletedFile { name, data: chunk })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_then_chunk_completes() {
        let mut assembler = FileAssembler::new();
        assert_eq!(assembler.state(), TransferState::AwaitName);

        assembler.accept_name("a.txt".to_string());
        assert_eq!(assembler.state(), TransferState::AwaitData);

        let file = assembler
            .accept_chunk(Bytes::from_static(&[1, 2, 3]))
            .unwrap();
        assert_eq!(file.name, "a.txt");
        assert_eq!(&file.data[..], &[1, 2, 3]);
        assert_eq!(assembler.state(), TransferState::AwaitName);
    }

    #[test]
    fn chunk_without_name_is_dropped() {
        let mut assembler = FileAssembler::new();
        assert!(assembler.accept_chunk(Bytes::from_static(b"orphan")).is_none());
        assert_eq!(assembler.state(), TransferState::AwaitName);
    }

    #[test]
    fn name_is_not_reused_for_next_chunk() {
        let mut assembler = FileAssembler::new();
        assembler.accept_name("first.bin".to_string());
        assert!(assembler.accept_chunk(Bytes::from_static(b"1")).is_some());
        assert!(assembler.accept_chunk(Bytes::from_static(b"2")).is_none());
    }

    #[test]
    fn second_name_overwrites_first() {
        let mut assembler = FileAssembler::new();
        assembler.accept_name("old.txt".to_string());
        assembler.accept_name("new.txt".to_string());
        let file = assembler.accept_chunk(Bytes::from_static(b"x")).unwrap();
        assert_eq!(file.name, "new.txt");
    }

    #[test]
    fn payload_is_handed_over_without_copying() {
        let mut assembler = FileAssembler::new();
        let payload = Bytes::from(vec![7u8; 1024]);
        assembler.accept_name("big.bin".to_string());
        let file = assembler.accept_chunk(payload.clone()).unwrap();
        assert_eq!(file.data.as_ptr(), payload.as_ptr());
    }

    #[test]
    fn back_to_back_transfers() {
        let mut assembler = FileAssembler::new();
        for (name, body) in [("one", &b"aa"[..]), ("two", &b"bbb"[..])] {
            assembler.accept_name(name.to_string());
            let file = assembler.accept_chunk(Bytes::copy_from_slice(body)).unwrap();
            assert_eq!(file.name, name);
            assert_eq!(&file.data[..], body);
        }
    }
}
