use std::ptr::NonNull;
use std::sync::mpsc;
use std::thread;

use chunk_pool::ChunkSettings;
use chunk_pool::MemPoolConfig;
use chunk_pool::MemoryManager;
use chunk_pool::SharedChunk;
use similar_asserts::assert_eq;
use test_log::test;
use utils::BumpAllocator;

struct Pools {
    _memory: Box<[u64]>,
    manager: MemoryManager,
}

fn pools(config: &MemPoolConfig) -> Box<Pools> {
    let bytes = config.required_chunk_memory_size().unwrap()
        + config.required_management_memory_size();
    let mut memory = vec![0u64; bytes.div_ceil(8)].into_boxed_slice();
    let base = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();
    let allocator = unsafe { BumpAllocator::from_raw(base, memory.len() * 8) };
    let manager = MemoryManager::new(config, &allocator, &allocator).unwrap();
    Box::new(Pools {
        _memory: memory,
        manager,
    })
}

fn used(pools: &Pools) -> (u32, u32) {
    (
        pools.manager.mem_pool_info(0).unwrap().used_chunks,
        pools.manager.chunk_management_pool_info().used_chunks,
    )
}

#[test]
fn eight_handles_in_nested_scopes() {
    let pools = pools(&MemPoolConfig::empty().add_mempool(64, 10));
    let settings = ChunkSettings::create(64, 8).unwrap();

    let original = pools.manager.get_chunk(&settings).unwrap();
    {
        let mut handles = Vec::new();
        for _ in 0..7 {
            let mut handle = SharedChunk::default();
            handle.clone_from(&original);
            handles.push(handle);
        }
        assert_eq!(original.reference_count(), 8);
        assert!(handles.iter().all(|handle| *handle == original));
        {
            let inner = handles.split_off(4);
            assert_eq!(inner.len(), 3);
        }
        assert_eq!(original.reference_count(), 5);
    }
    assert_eq!(used(&pools), (1, 1));
    drop(original);
    assert_eq!(used(&pools), (0, 0));
}

#[test]
fn chunks_travel_between_threads() {
    const MESSAGES: u64 = 200;

    let pools = pools(&MemPoolConfig::empty().add_mempool(8, 4));
    let settings = ChunkSettings::create(8, 8).unwrap();
    let (sender, receiver) = mpsc::sync_channel(2);

    thread::scope(|scope| {
        scope.spawn(move || {
            let mut sum = 0;
            for chunk_ref in receiver {
                let chunk = unsafe { SharedChunk::from_chunk_ref(chunk_ref) };
                let payload = chunk.user_payload().unwrap().cast::<u64>();
                sum += unsafe { payload.as_ptr().read() };
            }
            assert_eq!(sum, (0..MESSAGES).sum::<u64>());
        });

        for value in 0..MESSAGES {
            let chunk = loop {
                match pools.manager.get_chunk(&settings) {
                    Ok(chunk) => break chunk,
                    Err(_) => thread::yield_now(),
                }
            };
            let payload = chunk.user_payload().unwrap().cast::<u64>();
            unsafe { payload.as_ptr().write(value) };
            chunk.chunk_header().unwrap().set_sequence_number(value);
            sender.send(chunk.into_chunk_ref()).unwrap();
        }
        drop(sender);
    });

    assert_eq!(used(&pools), (0, 0));
    assert!(pools.manager.mem_pool_info(0).unwrap().min_free_chunks < 4);
}
