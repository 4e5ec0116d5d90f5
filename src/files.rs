//! File-handle table: sequential text I/O and random-access records

use crate::ast::OpenMode;
use crate::error::ErrorCode;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

/// One FIELD projection into the record buffer.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub offset: usize,
    pub width: usize,
    pub var: String,
}

enum Backing {
    /// Whole file slurped at open; classic sequential reads are tiny
    Input { content: Vec<u8>, pos: usize },
    Output { file: File, written: u64 },
    Random { file: File, last_record: usize },
}

/// An open file bound to a small integer number.
pub struct FileHandle {
    pub mode: OpenMode,
    backing: Backing,
    pub record_len: usize,
    pub record: Vec<u8>,
    pub fields: Vec<FieldSpec>,
}

impl FileHandle {
    fn open(path: &str, mode: OpenMode, record_len: usize) -> Result<Self, ErrorCode> {
        let backing = match mode {
            OpenMode::Input => {
                let mut content = Vec::new();
                File::open(path)
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                        _ => ErrorCode::PathNotFound,
                    })?
                    .read_to_end(&mut content)
                    .map_err(|_| ErrorCode::PathNotFound)?;
                Backing::Input { content, pos: 0 }
            }
            OpenMode::Output => {
                let file = File::create(path).map_err(|_| ErrorCode::PathNotFound)?;
                Backing::Output { file, written: 0 }
            }
            OpenMode::Append => {
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .map_err(|_| ErrorCode::PathNotFound)?;
                let written = file.metadata().map(|m| m.len()).unwrap_or(0);
                Backing::Output { file, written }
            }
            OpenMode::Random => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
                    .map_err(|_| ErrorCode::PathNotFound)?;
                Backing::Random { file, last_record: 0 }
            }
        };

        Ok(Self {
            mode,
            backing,
            record_len,
            record: vec![b' '; record_len],
            fields: Vec::new(),
        })
    }

    /// Raw text write for PRINT # / WRITE #.
    pub fn write_text(&mut self, text: &str) -> Result<(), ErrorCode> {
        match &mut self.backing {
            Backing::Output { file, written } => {
                file.write_all(text.as_bytes()).map_err(|_| ErrorCode::PathNotFound)?;
                *written += text.len() as u64;
                Ok(())
            }
            _ => Err(ErrorCode::BadFileNumber),
        }
    }

    fn reader(&mut self) -> Result<(&[u8], &mut usize), ErrorCode> {
        match &mut self.backing {
            Backing::Input { content, pos } => Ok((content, pos)),
            _ => Err(ErrorCode::BadFileNumber),
        }
    }

    /// One CRLF- or LF-delimited record.
    pub fn line_input(&mut self) -> Result<String, ErrorCode> {
        let (content, pos) = self.reader()?;
        if *pos >= content.len() {
            return Err(ErrorCode::InputPastEnd);
        }
        let mut line = Vec::new();
        while *pos < content.len() {
            let b = content[*pos];
            *pos += 1;
            if b == b'\n' {
                break;
            }
            if b != b'\r' {
                line.push(b);
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// One comma- or newline-delimited INPUT # item, quote-aware.
    pub fn input_item(&mut self) -> Result<String, ErrorCode> {
        let (content, pos) = self.reader()?;
        // Skip leading whitespace and record separators
        while *pos < content.len() && matches!(content[*pos], b' ' | b'\r' | b'\n' | b'\t') {
            *pos += 1;
        }
        if *pos >= content.len() {
            return Err(ErrorCode::InputPastEnd);
        }

        let mut item = Vec::new();
        if content[*pos] == b'"' {
            *pos += 1;
            while *pos < content.len() && content[*pos] != b'"' {
                item.push(content[*pos]);
                *pos += 1;
            }
            if *pos < content.len() {
                *pos += 1; // closing quote
            }
        } else {
            while *pos < content.len() && !matches!(content[*pos], b',' | b'\r' | b'\n') {
                item.push(content[*pos]);
                *pos += 1;
            }
            while item.last() == Some(&b' ') {
                item.pop();
            }
        }
        // Consume one delimiter
        while *pos < content.len() && content[*pos] == b' ' {
            *pos += 1;
        }
        if *pos < content.len() && content[*pos] == b',' {
            *pos += 1;
        } else {
            if *pos < content.len() && content[*pos] == b'\r' {
                *pos += 1;
            }
            if *pos < content.len() && content[*pos] == b'\n' {
                *pos += 1;
            }
        }
        Ok(String::from_utf8_lossy(&item).into_owned())
    }

    /// Exactly `n` characters, as INPUT$ sees them.
    pub fn input_chars(&mut self, n: usize) -> Result<String, ErrorCode> {
        let (content, pos) = self.reader()?;
        if *pos + n > content.len() {
            return Err(ErrorCode::InputPastEnd);
        }
        let slice = &content[*pos..*pos + n];
        *pos += n;
        Ok(slice.iter().map(|&b| b as char).collect())
    }

    pub fn eof(&self) -> bool {
        match &self.backing {
            Backing::Input { content, pos } => *pos >= content.len(),
            Backing::Output { .. } => true,
            Backing::Random { file, last_record } => {
                let len = file.metadata().map(|m| m.len()).unwrap_or(0);
                (*last_record * self.record_len) as u64 >= len
            }
        }
    }

    /// File length in bytes.
    pub fn lof(&self) -> u64 {
        match &self.backing {
            Backing::Input { content, .. } => content.len() as u64,
            Backing::Output { written, .. } => *written,
            Backing::Random { file, .. } => file.metadata().map(|m| m.len()).unwrap_or(0),
        }
    }

    /// Position: record number for random files, offset/128 for
    /// sequential ones, the classic way.
    pub fn loc(&self) -> u64 {
        match &self.backing {
            Backing::Input { pos, .. } => (*pos as u64) / 128,
            Backing::Output { written, .. } => *written / 128,
            Backing::Random { last_record, .. } => *last_record as u64,
        }
    }

    /// Read record `n` (1-based; `None` means the next one) into the
    /// record buffer.
    pub fn get_record(&mut self, n: Option<usize>) -> Result<(), ErrorCode> {
        let record_len = self.record_len;
        match &mut self.backing {
            Backing::Random { file, last_record } => {
                let rec = n.unwrap_or(*last_record + 1).max(1);
                file.seek(SeekFrom::Start(((rec - 1) * record_len) as u64))
                    .map_err(|_| ErrorCode::BadFileNumber)?;
                let mut buf = vec![0u8; record_len];
                let mut read = 0;
                while read < record_len {
                    match file.read(&mut buf[read..]) {
                        Ok(0) => break,
                        Ok(k) => read += k,
                        Err(_) => return Err(ErrorCode::BadFileNumber),
                    }
                }
                if read == 0 {
                    return Err(ErrorCode::InputPastEnd);
                }
                self.record = buf;
                *last_record = rec;
                Ok(())
            }
            _ => Err(ErrorCode::BadFileNumber),
        }
    }

    /// Write the record buffer as record `n`.
    pub fn put_record(&mut self, n: Option<usize>) -> Result<(), ErrorCode> {
        let record_len = self.record_len;
        self.record.resize(record_len, b' ');
        match &mut self.backing {
            Backing::Random { file, last_record } => {
                let rec = n.unwrap_or(*last_record + 1).max(1);
                file.seek(SeekFrom::Start(((rec - 1) * record_len) as u64))
                    .map_err(|_| ErrorCode::BadFileNumber)?;
                file.write_all(&self.record).map_err(|_| ErrorCode::BadFileNumber)?;
                *last_record = rec;
                Ok(())
            }
            _ => Err(ErrorCode::BadFileNumber),
        }
    }

    /// Install FIELD projections; widths must fit the record length.
    pub fn set_fields(&mut self, widths: Vec<(usize, String)>) -> Result<(), ErrorCode> {
        let mut offset = 0;
        let mut fields = Vec::new();
        for (width, var) in widths {
            fields.push(FieldSpec { offset, width, var });
            offset += width;
        }
        if offset > self.record_len {
            return Err(ErrorCode::IllegalFunctionCall);
        }
        self.fields = fields;
        Ok(())
    }

    /// The current text of one field slice.
    pub fn field_text(&self, spec: &FieldSpec) -> String {
        self.record[spec.offset..spec.offset + spec.width]
            .iter()
            .map(|&b| b as char)
            .collect()
    }

    /// Justify a string into a field slice.
    pub fn store_field(&mut self, spec: &FieldSpec, text: &str, right: bool) {
        let bytes: Vec<u8> = text.chars().map(|c| c as u32 as u8).collect();
        let slice = &mut self.record[spec.offset..spec.offset + spec.width];
        slice.fill(b' ');
        if bytes.len() >= slice.len() {
            slice.copy_from_slice(&bytes[..slice.len()]);
        } else if right {
            let start = slice.len() - bytes.len();
            slice[start..].copy_from_slice(&bytes);
        } else {
            slice[..bytes.len()].copy_from_slice(&bytes);
        }
    }
}

/// Open files keyed by their small integer numbers.
#[derive(Default)]
pub struct FileTable {
    handles: HashMap<u32, FileHandle>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        number: u32,
        path: &str,
        mode: OpenMode,
        record_len: Option<usize>,
    ) -> Result<(), ErrorCode> {
        if self.handles.contains_key(&number) {
            return Err(ErrorCode::FileAlreadyOpen);
        }
        log::debug!("open #{} {:?} as {:?}", number, path, mode);
        let handle = FileHandle::open(path, mode, record_len.unwrap_or(128))?;
        self.handles.insert(number, handle);
        Ok(())
    }

    /// Closing a number that is not open is a no-op, like the original.
    pub fn close(&mut self, number: u32) {
        self.handles.remove(&number);
    }

    pub fn close_all(&mut self) {
        self.handles.clear();
    }

    pub fn get(&mut self, number: u32) -> Result<&mut FileHandle, ErrorCode> {
        self.handles.get_mut(&number).ok_or(ErrorCode::BadFileNumber)
    }

    pub fn get_ref(&self, number: u32) -> Result<&FileHandle, ErrorCode> {
        self.handles.get(&number).ok_or(ErrorCode::BadFileNumber)
    }

    /// Which open file projects this FIELD variable, if any.
    pub fn field_owner(&self, var: &str) -> Option<(u32, FieldSpec)> {
        for (num, handle) in &self.handles {
            for spec in &handle.fields {
                if spec.var.eq_ignore_ascii_case(var) {
                    return Some((*num, spec.clone()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> String {
        let mut p = PathBuf::from(std::env::temp_dir());
        p.push(format!("gwbasic-files-{}-{}", std::process::id(), name));
        p.to_string_lossy().into_owned()
    }

    #[test]
    fn sequential_write_then_read() {
        let path = temp_path("seq.txt");
        let mut table = FileTable::new();
        table.open(1, &path, OpenMode::Output, None).unwrap();
        table.get(1).unwrap().write_text("HELLO\r\n42,\"A B\"\r\n").unwrap();
        table.close(1);

        table.open(1, &path, OpenMode::Input, None).unwrap();
        let f = table.get(1).unwrap();
        assert_eq!(f.line_input().unwrap(), "HELLO");
        assert_eq!(f.input_item().unwrap(), "42");
        assert_eq!(f.input_item().unwrap(), "A B");
        assert!(f.eof());
        assert!(matches!(f.input_item(), Err(ErrorCode::InputPastEnd)));
        table.close_all();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn double_open_is_fatal() {
        let path = temp_path("dup.txt");
        let mut table = FileTable::new();
        table.open(1, &path, OpenMode::Output, None).unwrap();
        assert!(matches!(
            table.open(1, &path, OpenMode::Output, None),
            Err(ErrorCode::FileAlreadyOpen)
        ));
        table.close_all();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unopened_number_is_fatal() {
        let mut table = FileTable::new();
        assert!(matches!(table.get(3), Err(ErrorCode::BadFileNumber)));
    }

    #[test]
    fn missing_input_file_is_fatal() {
        let mut table = FileTable::new();
        assert!(matches!(
            table.open(1, "/no/such/dir/nope.dat", OpenMode::Input, None),
            Err(ErrorCode::FileNotFound) | Err(ErrorCode::PathNotFound)
        ));
    }

    #[test]
    fn random_records_round_trip() {
        let path = temp_path("rand.dat");
        let mut table = FileTable::new();
        table.open(1, &path, OpenMode::Random, Some(16)).unwrap();
        {
            let f = table.get(1).unwrap();
            f.set_fields(vec![(10, "N$".into()), (6, "A$".into())]).unwrap();
            let name = f.fields[0].clone();
            let age = f.fields[1].clone();
            f.store_field(&name, "BOB", false);
            f.store_field(&age, "42", true);
            f.put_record(Some(2)).unwrap();

            f.store_field(&name, "SUE", false);
            f.store_field(&age, "7", true);
            f.put_record(Some(1)).unwrap();

            f.get_record(Some(2)).unwrap();
            assert_eq!(f.field_text(&name), "BOB       ");
            assert_eq!(f.field_text(&age), "    42");
            assert_eq!(f.loc(), 2);
            assert_eq!(f.lof(), 32);
        }
        table.close_all();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn field_overflow_is_fatal() {
        let path = temp_path("ovf.dat");
        let mut table = FileTable::new();
        table.open(1, &path, OpenMode::Random, Some(8)).unwrap();
        let f = table.get(1).unwrap();
        assert!(f.set_fields(vec![(6, "A$".into()), (6, "B$".into())]).is_err());
        table.close_all();
        let _ = std::fs::remove_file(&path);
    }
}
