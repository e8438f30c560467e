#![no_main]

use arbitrary::Arbitrary;
use bytes::{Buf, Bytes};
use libfuzzer_sys::fuzz_target;
use libight_buffer::{ByteBuffer, ReadLine};
use std::collections::VecDeque;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    operations: Vec<BufferOperation>,
}

#[derive(Arbitrary, Debug)]
enum BufferOperation {
    Write { data: Vec<u8> },
    WriteBytes { data: Vec<u8> },
    WriteRandom { count: u16 },
    Reserve { count: u16, commit: u16 },
    Read { upto: u16 },
    ReadN { n: u16 },
    ReadLine { maxline: u8 },
    Peek { upto: u16 },
    Discard { count: u16 },
    Advance { count: u16 },
    Append { data: Vec<u8> },
    TakeExtents,
}

fn take(model: &mut VecDeque<u8>, n: usize) -> Vec<u8> {
    model.drain(..n).collect()
}

fn fuzz(input: FuzzInput) {
    let mut buffer = ByteBuffer::new();
    let mut model = VecDeque::new();

    for operation in input.operations {
        match operation {
            BufferOperation::Write { data } => {
                buffer.write(&data).unwrap();
                model.extend(data);
            }
            BufferOperation::WriteBytes { data } => {
                model.extend(data.iter().copied());
                buffer.write_bytes(Bytes::from(data));
            }
            BufferOperation::WriteRandom { count } => {
                let count = count as usize;
                buffer.write_random(count).unwrap();
                // Random content is unknown to the model, so mirror it in
                let skip = model.len();
                let random = buffer.peek(skip + count).slice(skip..);
                assert_eq!(random.len(), count);
                model.extend(random.iter().copied());
            }
            BufferOperation::Reserve { count, commit } => {
                let count = count as usize;
                let commit = commit as usize;
                let mut reservation = buffer.reserve(count).unwrap();
                let mut value = 0u8;
                for extent in reservation.view_mut().iter_mut() {
                    for byte in extent.iter_mut() {
                        *byte = value;
                        value = value.wrapping_add(1);
                    }
                }
                if commit <= count {
                    reservation.commit(commit).unwrap();
                    model.extend((0..commit).map(|i| i as u8));
                } else {
                    assert!(reservation.commit(commit).is_err());
                }
            }
            BufferOperation::Read { upto } => {
                let out = buffer.read(upto as usize);
                let n = model.len().min(upto as usize);
                assert_eq!(out.as_ref(), take(&mut model, n).as_slice());
            }
            BufferOperation::ReadN { n } => {
                let n = n as usize;
                match buffer.readn(n) {
                    Some(out) => assert_eq!(out.as_ref(), take(&mut model, n).as_slice()),
                    None => assert!(model.len() < n),
                }
            }
            BufferOperation::ReadLine { maxline } => {
                let maxline = maxline as usize;
                let eol = model.iter().position(|b| *b == b'\n');
                match buffer.readline(maxline) {
                    ReadLine::Line(line) => {
                        let len = eol.unwrap() + 1;
                        assert!(len <= maxline);
                        assert_eq!(line.as_ref(), take(&mut model, len).as_slice());
                    }
                    ReadLine::Pending => assert!(eol.is_none() && model.len() <= maxline),
                    ReadLine::Overflow => assert!(eol.is_none() && model.len() > maxline),
                    ReadLine::TooLong => assert!(eol.unwrap() + 1 > maxline),
                }
            }
            BufferOperation::Peek { upto } => {
                let out = buffer.peek(upto as usize);
                let expected: Vec<u8> = model.iter().take(upto as usize).copied().collect();
                assert_eq!(out.as_ref(), expected.as_slice());
            }
            BufferOperation::Discard { count } => {
                let count = count as usize;
                if count <= model.len() {
                    buffer.discard(count).unwrap();
                    take(&mut model, count);
                } else {
                    assert!(buffer.discard(count).is_err());
                }
            }
            BufferOperation::Advance { count } => {
                let count = (count as usize).min(model.len());
                buffer.advance(count);
                take(&mut model, count);
            }
            BufferOperation::Append { data } => {
                let mut other = ByteBuffer::new();
                other.write(&data).unwrap();
                buffer.append(&mut other);
                assert!(other.is_empty());
                model.extend(data);
            }
            BufferOperation::TakeExtents => {
                let extents = buffer.take_extents();
                assert!(extents.iter().all(|extent| !extent.is_empty()));
                let n = model.len();
                assert_eq!(extents.concat(), take(&mut model, n));
            }
        }

        // Length always tracks exactly what is queued
        assert_eq!(buffer.len(), model.len());
        assert_eq!(buffer.view().total_len(), model.len());
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
