//! Write side of the shred pipeline: slices a slot's entry bytes into
//! signed data shreds, groups them into erasure sets, and generates the
//! Reed-Solomon coding shreds protecting each set.

use crate::shred::{
    self, ReedSolomonCache, Shred, ShredFlags, ShredVariant, DATA_SHREDS_PER_FEC_BLOCK,
    DATA_SHRED_PAYLOAD_SIZE, ERASURE_SHARD_SIZE, MAX_DATA_SHREDS_PER_SLOT,
    OFFSET_OF_CODING_POSITION, OFFSET_OF_DATA_FLAGS, OFFSET_OF_DATA_SIZE, OFFSET_OF_FEC_SET_INDEX,
    OFFSET_OF_NUM_CODING_SHREDS, OFFSET_OF_NUM_DATA_SHREDS, OFFSET_OF_PARENT_OFFSET,
    OFFSET_OF_SHRED_INDEX, OFFSET_OF_SHRED_SLOT, OFFSET_OF_SHRED_VARIANT, OFFSET_OF_SHRED_VERSION,
    SIZE_OF_CODING_SHRED_HEADERS, SIZE_OF_DATA_SHRED_HEADERS, SIZE_OF_MERKLE_ROOT,
    SIZE_OF_SIGNATURE,
};
use solana_clock::Slot;
use solana_hash::Hash;
use solana_keypair::Keypair;
use solana_sha256_hasher::hashv;
use solana_signer::Signer;

#[derive(Debug)]
pub struct Shredder {
    slot: Slot,
    parent_slot: Slot,
    version: u16,
    reference_tick: u8,
}

impl Shredder {
    pub fn new(
        slot: Slot,
        parent_slot: Slot,
        reference_tick: u8,
        version: u16,
    ) -> Result<Self, shred::Error> {
        if slot < parent_slot || slot - parent_slot > u64::from(u16::MAX) {
            return Err(shred::Error::InvalidParentSlot { slot, parent_slot });
        }
        if slot == parent_slot && slot != 0 {
            return Err(shred::Error::InvalidParentSlot { slot, parent_slot });
        }
        Ok(Self {
            slot,
            parent_slot,
            version,
            reference_tick,
        })
    }

    /// Slices `data` into erasure sets of up to
    /// [`DATA_SHREDS_PER_FEC_BLOCK`] data shreds, each protected by an
    /// equal number of coding shreds. Consecutive sets chain their Merkle
    /// roots when `chained_merkle_root` is given.
    #[allow(clippy::too_many_arguments)]
    pub fn shreds_from_data(
        &self,
        keypair: &Keypair,
        data: &[u8],
        is_last_in_slot: bool,
        chained_merkle_root: Option<Hash>,
        next_shred_index: u32,
        next_code_index: u32,
        reed_solomon_cache: &ReedSolomonCache,
    ) -> Result<(/*data:*/ Vec<Shred>, /*coding:*/ Vec<Shred>), shred::Error> {
        let chained = chained_merkle_root.is_some();
        let capacity = data_shred_capacity(chained);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            // A slot closes with at least one (empty) data shred so the
            // last-in-slot flag has a carrier.
            vec![&[]]
        } else {
            data.chunks(capacity).collect()
        };
        let mut data_shreds = Vec::with_capacity(chunks.len());
        let mut coding_shreds = Vec::new();
        let mut chained_root = chained_merkle_root;
        let mut shred_index = next_shred_index;
        let mut code_index = next_code_index;
        let num_sets = chunks.len().div_ceil(DATA_SHREDS_PER_FEC_BLOCK);
        for (nth, set_chunks) in chunks.chunks(DATA_SHREDS_PER_FEC_BLOCK).enumerate() {
            let (set_data, set_coding) = self.make_fec_set_shreds(
                keypair,
                set_chunks,
                shred_index,
                code_index,
                set_chunks.len(),
                is_last_in_slot && nth + 1 == num_sets,
                chained_root,
                reed_solomon_cache,
            )?;
            shred_index += set_data.len() as u32;
            code_index += set_coding.len() as u32;
            if chained {
                chained_root = set_data.first().and_then(Shred::merkle_root);
            }
            data_shreds.extend(set_data);
            coding_shreds.extend(set_coding);
        }
        Ok((data_shreds, coding_shreds))
    }

    /// Builds one erasure set: `chunks.len()` data shreds starting at
    /// index `fec_set_index` plus `num_coding_shreds` coding shreds
    /// starting at `first_coding_index`, all signed over the set's Merkle
    /// root.
    #[allow(clippy::too_many_arguments)]
    pub fn make_fec_set_shreds(
        &self,
        keypair: &Keypair,
        chunks: &[&[u8]],
        fec_set_index: u32,
        first_coding_index: u32,
        num_coding_shreds: usize,
        is_last_in_slot: bool,
        chained_merkle_root: Option<Hash>,
        reed_solomon_cache: &ReedSolomonCache,
    ) -> Result<(Vec<Shred>, Vec<Shred>), shred::Error> {
        let num_data = chunks.len();
        if num_data == 0 || num_coding_shreds == 0 || num_data + num_coding_shreds > 255 {
            return Err(shred::Error::InvalidErasureConfig {
                num_data,
                num_coding: num_coding_shreds,
            });
        }
        if fec_set_index as usize + num_data > MAX_DATA_SHREDS_PER_SLOT {
            return Err(shred::Error::InvalidShredIndex(fec_set_index));
        }
        let chained = chained_merkle_root.is_some();
        let data_variant = ShredVariant::MerkleData { chained };
        let capacity = data_shred_capacity(chained);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(num_data + num_coding_shreds);
        for (nth, chunk) in chunks.iter().enumerate() {
            if chunk.len() > capacity {
                return Err(shred::Error::InvalidDataSize {
                    size: chunk.len() as u16,
                    payload: DATA_SHRED_PAYLOAD_SIZE,
                });
            }
            let mut payload = vec![0u8; DATA_SHRED_PAYLOAD_SIZE];
            self.write_common_header(
                &mut payload,
                data_variant,
                fec_set_index + nth as u32,
                fec_set_index,
            );
            let parent_offset = (self.slot - self.parent_slot) as u16;
            payload[OFFSET_OF_PARENT_OFFSET..OFFSET_OF_PARENT_OFFSET + 2]
                .copy_from_slice(&parent_offset.to_le_bytes());
            let mut flags = self.reference_tick.min(ShredFlags::SHRED_TICK_REFERENCE_MASK.bits());
            if nth + 1 == num_data {
                flags |= ShredFlags::DATA_COMPLETE_SHRED.bits();
                if is_last_in_slot {
                    flags |= ShredFlags::LAST_SHRED_IN_SLOT.bits();
                }
            }
            payload[OFFSET_OF_DATA_FLAGS] = flags;
            let size = (SIZE_OF_DATA_SHRED_HEADERS + chunk.len()) as u16;
            payload[OFFSET_OF_DATA_SIZE..OFFSET_OF_DATA_SIZE + 2]
                .copy_from_slice(&size.to_le_bytes());
            payload[SIZE_OF_DATA_SHRED_HEADERS..SIZE_OF_DATA_SHRED_HEADERS + chunk.len()]
                .copy_from_slice(chunk);
            shards.push(payload);
        }

        // The set's Merkle root commits to every data payload body; the
        // root and signature regions are still zeroed at this point so
        // the commitment does not include itself.
        let merkle_root = {
            let bodies: Vec<&[u8]> = shards
                .iter()
                .map(|payload| &payload[SIZE_OF_SIGNATURE..])
                .collect();
            hashv(&bodies)
        };
        let signature = keypair.sign_message(merkle_root.as_ref());
        for payload in shards.iter_mut() {
            write_merkle_appendix(payload, data_variant, &merkle_root, chained_merkle_root);
            payload[..SIZE_OF_SIGNATURE].copy_from_slice(signature.as_ref());
        }

        // Parity covers the finished data payloads, signature and Merkle
        // appendix included, so recovery reproduces them byte for byte.
        shards.resize(num_data + num_coding_shreds, vec![0u8; ERASURE_SHARD_SIZE]);
        reed_solomon_cache
            .get(num_data, num_coding_shreds)?
            .encode(&mut shards)?;

        let code_variant = ShredVariant::MerkleCode { chained };
        let code_payload_size = code_variant.expected_payload_size();
        let mut data_shreds = Vec::with_capacity(num_data);
        let mut coding_shreds = Vec::with_capacity(num_coding_shreds);
        for (position, shard) in shards.into_iter().enumerate() {
            if position < num_data {
                data_shreds.push(Shred::new_from_serialized_shred(shard)?);
                continue;
            }
            let position = position - num_data;
            let mut payload = vec![0u8; code_payload_size];
            self.write_common_header(
                &mut payload,
                code_variant,
                first_coding_index + position as u32,
                fec_set_index,
            );
            payload[OFFSET_OF_NUM_DATA_SHREDS..OFFSET_OF_NUM_DATA_SHREDS + 2]
                .copy_from_slice(&(num_data as u16).to_le_bytes());
            payload[OFFSET_OF_NUM_CODING_SHREDS..OFFSET_OF_NUM_CODING_SHREDS + 2]
                .copy_from_slice(&(num_coding_shreds as u16).to_le_bytes());
            payload[OFFSET_OF_CODING_POSITION..OFFSET_OF_CODING_POSITION + 2]
                .copy_from_slice(&(position as u16).to_le_bytes());
            payload[SIZE_OF_CODING_SHRED_HEADERS..SIZE_OF_CODING_SHRED_HEADERS + ERASURE_SHARD_SIZE]
                .copy_from_slice(&shard);
            write_merkle_appendix(&mut payload, code_variant, &merkle_root, chained_merkle_root);
            payload[..SIZE_OF_SIGNATURE].copy_from_slice(signature.as_ref());
            coding_shreds.push(Shred::new_from_serialized_shred(payload)?);
        }
        Ok((data_shreds, coding_shreds))
    }

    fn write_common_header(
        &self,
        payload: &mut [u8],
        variant: ShredVariant,
        index: u32,
        fec_set_index: u32,
    ) {
        payload[OFFSET_OF_SHRED_VARIANT] = u8::from(variant);
        payload[OFFSET_OF_SHRED_SLOT..OFFSET_OF_SHRED_SLOT + 8]
            .copy_from_slice(&self.slot.to_le_bytes());
        payload[OFFSET_OF_SHRED_INDEX..OFFSET_OF_SHRED_INDEX + 4]
            .copy_from_slice(&index.to_le_bytes());
        payload[OFFSET_OF_SHRED_VERSION..OFFSET_OF_SHRED_VERSION + 2]
            .copy_from_slice(&self.version.to_le_bytes());
        payload[OFFSET_OF_FEC_SET_INDEX..OFFSET_OF_FEC_SET_INDEX + 4]
            .copy_from_slice(&fec_set_index.to_le_bytes());
    }
}

/// Entry bytes one data shred can carry. Chained variants trade 32 bytes
/// of capacity for the chained Merkle root.
pub fn data_shred_capacity(chained: bool) -> usize {
    let variant = ShredVariant::MerkleData { chained };
    DATA_SHRED_PAYLOAD_SIZE - SIZE_OF_DATA_SHRED_HEADERS - variant.merkle_appendix_size()
}

fn write_merkle_appendix(
    payload: &mut [u8],
    variant: ShredVariant,
    merkle_root: &Hash,
    chained_merkle_root: Option<Hash>,
) {
    let appendix = variant.merkle_appendix_size();
    let offset = payload.len() - appendix;
    payload[offset..offset + SIZE_OF_MERKLE_ROOT].copy_from_slice(merkle_root.as_ref());
    if let Some(chained_root) = chained_merkle_root {
        let offset = payload.len() - SIZE_OF_MERKLE_ROOT;
        payload[offset..].copy_from_slice(chained_root.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_data(size: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..size).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_shreds_from_data_round_trip() {
        let keypair = Keypair::new();
        let shredder = Shredder::new(5, 4, 3, 0).unwrap();
        let data = random_data(3 * data_shred_capacity(true) + 17);
        let (data_shreds, coding_shreds) = shredder
            .shreds_from_data(
                &keypair,
                &data,
                true, // is_last_in_slot
                Some(Hash::default()),
                0, // next_shred_index
                0, // next_code_index
                &ReedSolomonCache::default(),
            )
            .unwrap();
        assert_eq!(data_shreds.len(), 4);
        assert_eq!(coding_shreds.len(), 4);
        let mut deshredded = Vec::new();
        for (nth, shred) in data_shreds.iter().enumerate() {
            assert_eq!(shred.index(), nth as u32);
            assert_eq!(shred.slot(), 5);
            assert_eq!(shred.parent().unwrap(), 4);
            assert_eq!(shred.reference_tick(), 3);
            assert_eq!(shred.fec_set_index(), 0);
            assert_eq!(shred.last_in_slot(), nth == 3);
            assert_eq!(shred.data_complete(), nth == 3);
            assert!(shred.verify(&keypair.pubkey()));
            deshredded.extend_from_slice(shred.data().unwrap());
        }
        assert_eq!(deshredded, data);
        for (position, shred) in coding_shreds.iter().enumerate() {
            assert!(shred.is_code());
            assert_eq!(shred.index(), position as u32);
            assert_eq!(shred.fec_set_index(), 0);
            assert_eq!(shred.first_coding_index(), Some(0));
            assert!(shred.verify(&keypair.pubkey()));
        }
    }

    #[test]
    fn test_merkle_roots_chain_across_sets() {
        let keypair = Keypair::new();
        let shredder = Shredder::new(9, 8, 0, 0).unwrap();
        let data = random_data((DATA_SHREDS_PER_FEC_BLOCK + 5) * data_shred_capacity(true));
        let chained_root = Hash::new_from_array([42u8; 32]);
        let (data_shreds, coding_shreds) = shredder
            .shreds_from_data(
                &keypair,
                &data,
                false,
                Some(chained_root),
                0,
                0,
                &ReedSolomonCache::default(),
            )
            .unwrap();
        // Two erasure sets; the first chains to the given root, the second
        // to the first set's Merkle root.
        let first = &data_shreds[0];
        let second = &data_shreds[DATA_SHREDS_PER_FEC_BLOCK];
        assert_eq!(first.fec_set_index(), 0);
        assert_eq!(second.fec_set_index(), DATA_SHREDS_PER_FEC_BLOCK as u32);
        assert_eq!(first.chained_merkle_root(), Some(chained_root));
        assert_eq!(second.chained_merkle_root(), first.merkle_root());
        assert_ne!(first.merkle_root(), second.merkle_root());
        // All shreds of one set, coding included, carry the same root.
        for shred in data_shreds
            .iter()
            .take(DATA_SHREDS_PER_FEC_BLOCK)
            .chain(coding_shreds.iter().take(DATA_SHREDS_PER_FEC_BLOCK))
        {
            assert_eq!(shred.merkle_root(), first.merkle_root());
        }
    }

    #[test]
    fn test_recover_punctured_set() {
        let keypair = Keypair::new();
        let shredder = Shredder::new(3, 2, 0, 0).unwrap();
        let reed_solomon_cache = ReedSolomonCache::default();
        let data = random_data(8 * data_shred_capacity(false));
        let (data_shreds, coding_shreds) = shredder
            .shreds_from_data(&keypair, &data, true, None, 0, 0, &reed_solomon_cache)
            .unwrap();
        assert_eq!(data_shreds.len(), 8);
        // Drop every other data shred and recover from the remainder.
        let available: Vec<Shred> = data_shreds
            .iter()
            .step_by(2)
            .chain(coding_shreds.iter().step_by(2))
            .cloned()
            .collect();
        let recovered = shred::recover(available, &reed_solomon_cache).unwrap();
        let (recovered_data, recovered_coding): (Vec<Shred>, Vec<Shred>) =
            recovered.into_iter().partition(Shred::is_data);
        assert_eq!(recovered_data.len(), 4);
        assert_eq!(recovered_coding.len(), 4);
        for shred in recovered_data {
            assert_eq!(shred.payload(), data_shreds[shred.index() as usize].payload());
            assert!(shred.verify(&keypair.pubkey()));
        }
        // Merkle coding shreds are rebuilt as well, byte for byte.
        for shred in recovered_coding {
            assert_eq!(shred.payload(), coding_shreds[shred.index() as usize].payload());
            assert!(shred.verify(&keypair.pubkey()));
        }
    }

    #[test]
    fn test_new_rejects_bad_parent() {
        assert!(Shredder::new(1, 2, 0, 0).is_err());
        assert!(Shredder::new(2, 2, 0, 0).is_err());
        assert!(Shredder::new(0, 0, 0, 0).is_ok());
        assert!(Shredder::new(u64::from(u16::MAX) + 5, 1, 0, 0).is_err());
    }
}

