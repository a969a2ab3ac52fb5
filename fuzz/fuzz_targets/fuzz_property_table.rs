#![no_main]

use std::collections::HashMap;

use jsheap::{Attributes, IdentifierTable, PropertyTable, ShapeConfig, Value};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Limit input size to avoid timeout
    if data.len() > 4_096 {
        return;
    }

    let mut names = IdentifierTable::new();
    let keys: Vec<_> = (0..32).map(|i| names.intern(&format!("k{}", i))).collect();
    let mut table = PropertyTable::new(&ShapeConfig::default());
    let mut storage = Vec::new();
    let mut model: HashMap<usize, i32> = HashMap::new();

    for (step, &byte) in data.iter().enumerate() {
        let key_index = usize::from(byte & 0x1f);
        let key = &keys[key_index];
        if byte & 0x80 == 0 {
            let offset = table
                .put(key, Attributes::empty(), false, Some(&mut storage))
                .unwrap();
            let value = step as i32 & 0xffff;
            storage[offset] = Value::from_i32(value).unwrap();
            model.insert(key_index, value);
        } else {
            let removed = table.remove(key, Some(&mut storage));
            assert_eq!(removed.is_some(), model.remove(&key_index).is_some());
        }

        // Every live key reads back its own value
        assert_eq!(table.len(), model.len());
        for (&index, &value) in &model {
            let offset = table.get_offset(&keys[index]).unwrap();
            assert_eq!(storage[offset].as_i32(), Some(value));
        }
        table.check_consistency().unwrap();
    }
});
