/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    IndexOutOfBound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bitmap index out of bound")
    }
}

impl std::error::Error for Error {}

/// Fixed size bit set, positions in `0..len`.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize, init_all_true: bool) -> Self {
        let fill = if init_all_true { u64::MAX } else { 0 };
        let mut words = vec![fill; (len + WORD_BITS - 1) / WORD_BITS];
        let tail = len % WORD_BITS;
        if init_all_true && tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Bitmap { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn locate(&self, pos: usize) -> Result<(usize, u64), Error> {
        if pos >= self.len {
            return Err(Error::IndexOutOfBound);
        }
        Ok((pos / WORD_BITS, 1u64 << (pos % WORD_BITS)))
    }

    // if success, return old value
    pub fn set(&mut self, pos: usize, val: bool) -> Result<bool, Error> {
        let (idx, mask) = self.locate(pos)?;
        let old = self.words[idx] & mask != 0;
        if val {
            self.words[idx] |= mask;
        } else {
            self.words[idx] &= !mask;
        }
        Ok(old)
    }

    pub fn get(&self, pos: usize) -> Result<bool, Error> {
        let (idx, mask) = self.locate(pos)?;
        Ok(self.words[idx] & mask != 0)
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            let mut w = *word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(idx * WORD_BITS + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut bitmap = Bitmap::new(100, false);
        assert_eq!(bitmap.set(0, true), Ok(false));
        assert_eq!(bitmap.set(63, true), Ok(false));
        assert_eq!(bitmap.set(64, true), Ok(false));
        assert_eq!(bitmap.set(64, true), Ok(true));
        assert_eq!(bitmap.get(63), Ok(true));
        assert_eq!(bitmap.get(1), Ok(false));
        assert_eq!(bitmap.count_ones(), 3);
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), vec![0, 63, 64]);

        assert_eq!(bitmap.set(64, false), Ok(true));
        assert_eq!(bitmap.count_ones(), 2);
    }

    #[test]
    fn out_of_bound() {
        let mut bitmap = Bitmap::new(10, false);
        assert_eq!(bitmap.set(10, true), Err(Error::IndexOutOfBound));
        assert_eq!(bitmap.get(usize::MAX), Err(Error::IndexOutOfBound));
    }

    #[test]
    fn all_true_respects_len() {
        let mut bitmap = Bitmap::new(70, true);
        assert_eq!(bitmap.count_ones(), 70);
        bitmap.clear();
        assert_eq!(bitmap.count_ones(), 0);
        assert!(!bitmap.is_empty());
    }
}
