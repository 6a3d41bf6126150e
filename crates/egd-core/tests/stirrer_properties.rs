use egd_core::stirrer::stir;
use proptest::prelude::*;

proptest! {
    #[test]
    fn stir_preserves_length(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert_eq!(stir(&data).len(), data.len());
    }

    #[test]
    fn stir_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert_eq!(stir(&data), stir(&data));
    }

    #[test]
    fn stir_of_distinct_inputs_usually_differs(
        data in proptest::collection::vec(any::<u8>(), 32..4096),
        flip_index in 0usize..32,
    ) {
        let mut other = data.clone();
        other[flip_index] ^= 0x01;
        prop_assert_ne!(stir(&data), stir(&other));
    }
}
