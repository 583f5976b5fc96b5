//! The folder: 7z's coder graph.
//!
//! A folder chains one or more coders. Bind pairs join a coder's output to
//! another's input; the packed streams feed the unbound inputs, and exactly
//! one output is left unbound — the folder's final output.

/// A directed coder graph decoding packed streams into sub-streams.
#[derive(Debug, Default, Clone)]
pub struct Folder {
    /// The coders in header order.
    pub coders: Vec<Coder>,
    /// Whether the folder's output CRC is recorded.
    pub has_crc: bool,
    /// CRC-32 of the folder's final output.
    pub crc: u64,
    pub(crate) total_input_streams: usize,
    pub(crate) total_output_streams: usize,
    pub(crate) bind_pairs: Vec<BindPair>,
    pub(crate) packed_streams: Vec<u64>,
    pub(crate) unpack_sizes: Vec<u64>,
    pub(crate) num_unpack_sub_streams: usize,
}

impl Folder {
    pub(crate) fn find_bind_pair_for_in_stream(&self, index: usize) -> Option<usize> {
        let index = index as u64;
        (0..self.bind_pairs.len()).find(|&i| self.bind_pairs[i].in_index == index)
    }

    pub(crate) fn find_bind_pair_for_out_stream(&self, index: usize) -> Option<usize> {
        let index = index as u64;
        (0..self.bind_pairs.len()).find(|&i| self.bind_pairs[i].out_index == index)
    }

    /// The size of the folder's final (unbound) output stream.
    pub fn unpack_size(&self) -> u64 {
        for i in (0..self.total_output_streams).rev() {
            if self.find_bind_pair_for_out_stream(i).is_none() {
                return self.unpack_sizes.get(i).copied().unwrap_or(0);
            }
        }
        0
    }

    /// The output size of the coder at `index`.
    pub fn unpack_size_at(&self, index: usize) -> u64 {
        self.unpack_sizes.get(index).copied().unwrap_or(0)
    }

    /// Walks the coders from the packed input towards the final output.
    pub fn ordered_coders(&self) -> OrderedCoderIter<'_> {
        OrderedCoderIter {
            folder: self,
            current: self.packed_streams.first().copied(),
        }
    }
}

/// One coder: a method id plus its property blob.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Coder {
    pub(crate) method_id: [u8; 0xF],
    pub(crate) id_size: usize,
    pub(crate) num_in_streams: u64,
    pub(crate) num_out_streams: u64,
    /// Method-specific properties.
    pub properties: Vec<u8>,
}

impl Coder {
    /// The coder's method id bytes.
    pub fn method_id(&self) -> &[u8] {
        &self.method_id[..self.id_size]
    }

    pub(crate) fn method_id_mut(&mut self) -> &mut [u8] {
        &mut self.method_id[..self.id_size]
    }

    pub(crate) fn with_id(id: &[u8]) -> Self {
        let mut coder = Coder {
            id_size: id.len(),
            num_in_streams: 1,
            num_out_streams: 1,
            ..Default::default()
        };
        coder.method_id[..id.len()].copy_from_slice(id);
        coder
    }
}

/// One edge of the graph: output `out_index` feeds input `in_index`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BindPair {
    pub(crate) in_index: u64,
    pub(crate) out_index: u64,
}

/// Iterates `(coder_index, coder)` in decode order.
pub struct OrderedCoderIter<'a> {
    folder: &'a Folder,
    current: Option<u64>,
}

impl<'a> Iterator for OrderedCoderIter<'a> {
    type Item = (usize, &'a Coder);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.current?;
        self.current = self
            .folder
            .find_bind_pair_for_out_stream(i as usize)
            .map(|pair| self.folder.bind_pairs[pair].in_index);
        self.folder
            .coders
            .get(i as usize)
            .map(|coder| (i as usize, coder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two coders, packed stream 0 feeds coder 0, whose output feeds coder 1.
    fn chained_folder() -> Folder {
        Folder {
            coders: vec![Coder::with_id(&[0x21]), Coder::with_id(&[0x03])],
            total_input_streams: 2,
            total_output_streams: 2,
            bind_pairs: vec![BindPair {
                in_index: 1,
                out_index: 0,
            }],
            packed_streams: vec![0],
            unpack_sizes: vec![100, 90],
            num_unpack_sub_streams: 1,
            ..Default::default()
        }
    }

    #[test]
    fn final_output_is_the_unbound_one() {
        assert_eq!(chained_folder().unpack_size(), 90);
    }

    #[test]
    fn ordered_walk_follows_bind_pairs() {
        let folder = chained_folder();
        let order: Vec<usize> = folder.ordered_coders().map(|(i, _)| i).collect();
        assert_eq!(order, vec![0, 1]);
    }
}
