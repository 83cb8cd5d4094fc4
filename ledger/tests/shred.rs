use slate_ledger::shred::{self, ReedSolomonCache, Shred, DATA_SHREDS_PER_FEC_BLOCK};
use slate_ledger::shredder::{data_shred_capacity, Shredder};
use solana_clock::Slot;
use solana_hash::Hash;
use solana_keypair::Keypair;
use solana_signer::Signer;
use std::collections::BTreeMap;
use test_case::test_case;

type IndexShredsMap = BTreeMap<u32, Vec<Shred>>;

fn sort_shreds_into_fec_sets(
    shreds: Vec<Shred>,
    fec_data: &mut IndexShredsMap,
    fec_coding: &mut IndexShredsMap,
) {
    for shred in shreds {
        let entry = if shred.is_data() {
            fec_data.entry(shred.fec_set_index()).or_default()
        } else {
            fec_coding.entry(shred.fec_set_index()).or_default()
        };
        entry.push(shred);
    }
}

#[test_case(false)]
#[test_case(true)]
fn test_multi_fec_block_coding(is_last_in_slot: bool) {
    let keypair = Keypair::new();
    let slot: Slot = 0x1234_5678_9abc_def0;
    let shredder = Shredder::new(slot, slot - 5, 0, 0).unwrap();
    let reed_solomon_cache = ReedSolomonCache::default();
    let num_fec_sets = 10;
    let num_data_shreds = DATA_SHREDS_PER_FEC_BLOCK * num_fec_sets;

    // Enough random-ish data to fill `num_fec_sets` complete erasure sets.
    let capacity = data_shred_capacity(/*chained:*/ true);
    let data: Vec<u8> = (0..num_data_shreds * capacity).map(|i| i as u8).collect();

    let (data_shreds, coding_shreds) = shredder
        .shreds_from_data(
            &keypair,
            &data,
            is_last_in_slot,
            Some(Hash::default()),
            0, // next_shred_index
            0, // next_code_index
            &reed_solomon_cache,
        )
        .unwrap();
    assert_eq!(data_shreds.len(), num_data_shreds);
    assert_eq!(coding_shreds.len(), num_data_shreds);
    for shred in &coding_shreds {
        assert!(!shred.is_data());
    }
    assert_eq!(data_shreds.last().unwrap().last_in_slot(), is_last_in_slot);

    let mut fec_data = IndexShredsMap::new();
    let mut fec_coding = IndexShredsMap::new();
    sort_shreds_into_fec_sets(
        data_shreds
            .iter()
            .chain(coding_shreds.iter())
            .cloned()
            .collect(),
        &mut fec_data,
        &mut fec_coding,
    );
    assert_eq!(fec_data.len(), num_fec_sets);
    assert_eq!(fec_coding.len(), num_fec_sets);

    // Drop every other shred of each set and recover the missing data
    // shreds from the remainder.
    let mut all_shreds = vec![];
    for (fec_data_shreds, fec_coding_shreds) in fec_data.values().zip(fec_coding.values()) {
        let first_data_index = fec_data_shreds[0].index();
        let available: Vec<Shred> = fec_data_shreds
            .iter()
            .enumerate()
            .filter_map(|(i, shred)| (i % 2 != 0).then(|| shred.clone()))
            .chain(
                fec_coding_shreds
                    .iter()
                    .enumerate()
                    .filter_map(|(i, shred)| (i % 2 != 0).then(|| shred.clone())),
            )
            .collect();
        let recovered = shred::recover(available.clone(), &reed_solomon_cache).unwrap();
        let (recovered_data, recovered_coding): (Vec<Shred>, Vec<Shred>) =
            recovered.into_iter().partition(Shred::is_data);
        assert_eq!(recovered_data.len(), fec_data_shreds.len() / 2);
        assert_eq!(recovered_coding.len(), fec_coding_shreds.len() / 2);
        for recovered_shred in &recovered_data {
            assert_eq!(recovered_shred.slot(), slot);
            assert!(recovered_shred.verify(&keypair.pubkey()));
            let original = &fec_data_shreds[(recovered_shred.index() - first_data_index) as usize];
            assert_eq!(recovered_shred.payload(), original.payload());
        }
        let first_coding_index = fec_coding_shreds[0].index();
        for recovered_shred in &recovered_coding {
            assert_eq!(recovered_shred.slot(), slot);
            assert!(recovered_shred.verify(&keypair.pubkey()));
            let original =
                &fec_coding_shreds[(recovered_shred.index() - first_coding_index) as usize];
            assert_eq!(recovered_shred.payload(), original.payload());
        }
        all_shreds.extend(recovered_data);
        all_shreds.extend(available.into_iter().filter(Shred::is_data));
    }

    // The union of the surviving and recovered shreds carries the
    // original data, byte for byte.
    all_shreds.sort_by_key(Shred::index);
    let reassembled: Vec<u8> = all_shreds
        .iter()
        .flat_map(|shred| shred.data().unwrap().iter().copied())
        .collect();
    assert_eq!(reassembled, data);
}

#[test]
fn test_chained_merkle_roots_across_sets() {
    let keypair = Keypair::new();
    let slot: Slot = 42;
    let shredder = Shredder::new(slot, 41, 0, 0).unwrap();
    let reed_solomon_cache = ReedSolomonCache::default();
    let chained_root = Hash::new_from_array([11u8; 32]);

    let capacity = data_shred_capacity(/*chained:*/ true);
    let data: Vec<u8> = vec![3u8; 3 * DATA_SHREDS_PER_FEC_BLOCK * capacity];
    let (data_shreds, coding_shreds) = shredder
        .shreds_from_data(
            &keypair,
            &data,
            true,
            Some(chained_root),
            0,
            0,
            &reed_solomon_cache,
        )
        .unwrap();

    let mut fec_data = IndexShredsMap::new();
    let mut fec_coding = IndexShredsMap::new();
    sort_shreds_into_fec_sets(
        data_shreds.into_iter().chain(coding_shreds).collect(),
        &mut fec_data,
        &mut fec_coding,
    );
    assert_eq!(fec_data.len(), 3);

    // Every shred of a set carries the set's Merkle root, and each set
    // chains to the root of the set before it.
    let mut expected_chained_root = chained_root;
    for (fec_set_index, set_shreds) in &fec_data {
        let merkle_root = set_shreds[0].merkle_root().unwrap();
        for shred in set_shreds.iter().chain(&fec_coding[fec_set_index]) {
            assert_eq!(shred.merkle_root(), Some(merkle_root));
            assert_eq!(shred.chained_merkle_root(), Some(expected_chained_root));
        }
        expected_chained_root = merkle_root;
    }
}
